//! Storage layer tests

mod database_tests;
