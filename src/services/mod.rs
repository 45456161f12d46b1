pub mod broker;
pub mod classifier;
pub mod notifier;
pub mod storage;
