//! 剂量计算引擎实现

pub mod replay;

pub use replay::ReplayPlan;
