pub mod accessor;
pub mod mimetype;
