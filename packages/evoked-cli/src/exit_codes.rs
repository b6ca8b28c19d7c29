// Process exit codes

pub const SUCCESS: i32 = 0;
/// The engine or output failed at run time
pub const EXECUTION_ERROR: i32 = 1;
/// Bad arguments or an invalid configuration file
pub const INPUT_ERROR: i32 = 2;
