//! Integration tests: the coach facade driven end to end against a
//! scripted league source.

mod coach_flow;
mod mock_source;
