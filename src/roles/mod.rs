pub mod replier;
pub mod requestor;
