mod tests_manager;
mod tests_validate;
