mod helpers;
mod tests_comparator;
mod tests_dup;
mod tests_main;
