mod helpers;
mod tests_blocks;
