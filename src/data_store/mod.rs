/// Column values exchanged with the engine.
pub mod value;
/// Statement results.
pub mod row_set;
/// The append-only record of what each step produced.
pub mod observation_log;
