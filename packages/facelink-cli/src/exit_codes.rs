/// Process exit codes
pub const SUCCESS: i32 = 0;
/// Runtime failure (network, backend, output)
pub const EXECUTION_ERROR: i32 = 1;
/// Bad arguments, configuration or input files
pub const INPUT_ERROR: i32 = 2;
/// The backend session could not be established
pub const CONNECTION_ERROR: i32 = 3;
