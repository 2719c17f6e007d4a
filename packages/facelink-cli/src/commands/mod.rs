pub mod detect;
pub mod run;
pub mod session;
