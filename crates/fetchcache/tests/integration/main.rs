mod persistence;
mod utils;
mod workflow;
