mod helpers;
mod tests_table;
