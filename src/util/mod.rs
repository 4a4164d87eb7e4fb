pub mod fs;
pub mod privilege;
pub mod unix;
