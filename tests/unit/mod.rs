mod helpers;

mod cache_tests;
mod client_tests;
mod xml_tests;
