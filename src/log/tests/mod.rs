mod helpers;
mod tests_append;
mod tests_recovery;
