// Library root: data model, store, sync engine and presentation state machine
// for live sweepstake draws.

pub mod allocator;
pub mod config;
pub mod connection;
pub mod countdown;
pub mod db;
pub mod feed;
pub mod live_view;
pub mod model;
pub mod novelty;
pub mod payments;
pub mod presentation;
pub mod sync;
pub mod transport;
