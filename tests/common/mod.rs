//! Shared test utilities

use std::sync::Arc;

use pagedb::paging::PagingResult;
use pagedb::{PageCodec, PageId, PageIo, StoreConfig, TxPageFile};
use tempfile::TempDir;

/// Length-prefixed single-page string codec, standing in for the
/// record marshalling an index layer would provide.
pub struct StringCodec;

impl PageCodec for StringCodec {
    type Value = String;

    fn store(
        &self,
        io: &mut dyn PageIo,
        page: PageId,
        value: &String,
    ) -> PagingResult<Vec<PageId>> {
        let bytes = value.as_bytes();
        assert!(bytes.len() + 4 <= io.page_size() as usize);
        let mut buf = Vec::with_capacity(4 + bytes.len());
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
        io.write(page, &buf)?;
        Ok(Vec::new())
    }

    fn load(&self, io: &mut dyn PageIo, page: PageId) -> PagingResult<String> {
        let mut buf = vec![0u8; io.page_size() as usize];
        io.read(page, &mut buf)?;
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let len = len.min(buf.len() - 4);
        Ok(String::from_utf8_lossy(&buf[4..4 + len]).into_owned())
    }

    fn linked_pages(&self, _io: &mut dyn PageIo, _page: PageId) -> PagingResult<Vec<PageId>> {
        Ok(Vec::new())
    }
}

pub fn codec() -> Arc<StringCodec> {
    Arc::new(StringCodec)
}

pub fn temp_dir() -> TempDir {
    TempDir::new().expect("failed to create temp dir")
}

pub fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path().join("pages.db")).page_size(512)
}

pub fn open_store(dir: &TempDir) -> TxPageFile {
    TxPageFile::open(store_config(dir)).expect("failed to open store")
}
