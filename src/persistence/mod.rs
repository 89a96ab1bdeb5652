pub mod file_manager;
#[cfg(test)]
pub mod memory;
