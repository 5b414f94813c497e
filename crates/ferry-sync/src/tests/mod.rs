//! End-to-end tests of the file sync service over in-memory backends.

mod helpers;

mod deletion;
