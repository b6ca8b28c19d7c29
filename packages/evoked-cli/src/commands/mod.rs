pub mod defaults;
pub mod simulate;
pub mod validate;
