mod tests_summary;
