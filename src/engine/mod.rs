pub mod coordinator;
pub mod ledger;
pub mod notify;
pub mod reaper;
pub mod rounds;
pub mod selector;
pub mod store;
