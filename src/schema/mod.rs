pub mod contracts;
pub mod validator;
