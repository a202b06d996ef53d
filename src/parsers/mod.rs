mod raw;

#[cfg(test)]
pub use raw::write_raw_dose;
pub use raw::RawDoseParser;

/// 获取所有可用的解析器
pub fn get_all_parsers() -> Vec<Box<dyn crate::utils::parser::DoseGridParser>> {
    vec![Box::new(RawDoseParser::new())]
}
