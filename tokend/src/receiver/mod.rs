pub mod stdin;
pub mod web;

pub use stdin::StdinReceiver;
pub use web::WebReceiver;
