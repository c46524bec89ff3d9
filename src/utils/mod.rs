pub mod currency;
pub mod token;
