use std::path::Path;

use crate::utils::parser::DoseGridParser;

/// 解析器注册表
/// 管理所有可用的剂量网格解析器，并根据文件扩展名匹配对应的解析器
pub struct ParserRegistry {
    parsers: Vec<Box<dyn DoseGridParser>>,
}

impl ParserRegistry {
    /// 创建新的解析器注册表，自动注册所有可用的解析器
    pub fn new() -> Self {
        let parsers = crate::parsers::get_all_parsers();
        Self { parsers }
    }

    /// 根据文件扩展名查找匹配的解析器
    /// extension: 文件扩展名（不含点号），例如 "rawdose"
    pub fn find_parser(&self, extension: &str) -> Option<&dyn DoseGridParser> {
        self.parsers
            .iter()
            .find(|parser| parser.supports(extension))
            .map(|p| p.as_ref())
    }

    /// 根据文件路径查找匹配的解析器
    pub fn find_parser_for_file(&self, file_path: &Path) -> Option<&dyn DoseGridParser> {
        let extension = file_path.extension().and_then(|ext| ext.to_str())?;
        self.find_parser(extension)
    }

    /// 在目录中按 stem 查找第一个可解析的文件，例如 "layer0_spot3" -> "layer0_spot3.rawdose"
    pub fn resolve_file(&self, dir: &Path, stem: &str) -> Option<std::path::PathBuf> {
        self.supported_extensions()
            .into_iter()
            .map(|ext| dir.join(format!("{}.{}", stem, ext)))
            .find(|candidate| candidate.is_file())
    }

    /// 获取所有支持的扩展名列表
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        for parser in &self.parsers {
            extensions.extend(
                parser
                    .supported_extensions()
                    .iter()
                    .map(|s| s.to_lowercase()),
            );
        }
        extensions.sort();
        extensions.dedup();
        extensions
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
