pub mod chatmodels;
pub mod escrowmodel;
pub mod jobmodel;
