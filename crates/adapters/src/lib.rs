pub mod keychain;
pub mod mysql;
