//! Import and rebuild tests

mod ldif_import_tests;
