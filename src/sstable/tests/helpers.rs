use std::path::Path;
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::entry::Entry;
use crate::filter::BloomFilter;
use crate::manifest::TableMeta;
use crate::sstable::{SSTable, SstWriter, TableSummary, filter_path};

pub const BLOCK_SIZE: usize = 4096;

/// Builds a table (plus sibling filter) from the given records and
/// returns the opened reader.
pub fn build_table<K: AsRef<[u8]>>(
    dir: &Path,
    filename: &str,
    records: &[(K, Entry)],
) -> Arc<SSTable> {
    let path = dir.join(filename);
    let mut writer = SstWriter::create(&path, BLOCK_SIZE).unwrap();
    let mut filter = BloomFilter::new(records.len(), 0.01);
    for (key, entry) in records {
        writer.add(key.as_ref(), entry).unwrap();
        filter.insert(key.as_ref());
    }
    let summary = writer.finish().unwrap();
    filter.write_to(&filter_path(&path)).unwrap();

    open_table(dir, filename, &summary)
}

/// Opens a table with metadata derived from a writer summary.
pub fn open_table(dir: &Path, filename: &str, summary: &TableSummary) -> Arc<SSTable> {
    let meta = TableMeta {
        level: 0,
        sequence: 1,
        filename: filename.to_string(),
        first_key: summary.first_key.clone(),
        last_key: summary.last_key.clone(),
        file_size: summary.file_size,
    };
    Arc::new(SSTable::open(dir, meta).unwrap())
}

/// Ascending `(key, value)` records, keys zero-padded for byte order.
pub fn sequential_records(count: u32) -> Vec<(Vec<u8>, Entry)> {
    (0..count)
        .map(|i| {
            (
                format!("key_{i:08}").into_bytes(),
                Entry::Value(format!("value_{i:08}").into_bytes()),
            )
        })
        .collect()
}

pub fn cache() -> BlockCache {
    BlockCache::new(4 * 1024 * 1024)
}
