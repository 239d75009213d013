mod helpers;
mod tests_compaction;
mod tests_put_get;
