mod tests_sweep;
