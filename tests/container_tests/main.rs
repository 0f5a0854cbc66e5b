//! Entry container tests

mod entry_tests;
mod search_tests;
