pub mod external_delivery_tests;
pub mod failure_signal_tests;
pub mod handler_absent_tests;
pub mod stacktrace_tests;
