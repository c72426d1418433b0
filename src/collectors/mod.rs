pub mod command;
pub mod site;
pub mod system;
