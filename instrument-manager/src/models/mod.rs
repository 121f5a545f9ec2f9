// Configuration and response types

pub mod responses;
pub mod settings;
