use std::{
    mem,
    thread::{self, JoinHandle},
    vec,
};

use log::{trace, warn};

use crate::{
    config::MIN_PAGE_SIZE,
    data::Data,
    error::{Error, Result},
    protocol::Row,
};

use super::table::RemoteTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Ordered range scan over a remote table, one page at a time.
///
/// A page that comes back full has its last row withheld: that key is where
/// the next page starts, so it is yielded exactly once as the head of the
/// next page. While the caller drains a page the next one is already being
/// fetched on a background thread. A short page ends the scan.
///
/// The server may cut a page early to keep its response frame bounded. It
/// then reports the shortened length as the page's count, and a page of that
/// length still counts as full.
///
/// Dropping a scan detaches any in-flight fetch and discards its page.
pub struct RemoteScan {
    table: RemoteTable,
    direction: Direction,
    to: Option<Data>,
    page_size: usize,
    current: vec::IntoIter<Row>,
    next: NextPage,
}

/// One page as returned by the server. `limit` is the page count it echoed.
pub(crate) struct Page {
    pub(crate) rows: Vec<Row>,
    pub(crate) limit: usize,
}

enum NextPage {
    /// Not requested yet; fetched in the foreground when needed.
    Start(Option<Data>),
    InFlight(JoinHandle<Result<Page>>),
    Done,
}

impl RemoteScan {
    pub(crate) fn new(
        table: RemoteTable,
        direction: Direction,
        from: Option<Data>,
        to: Option<Data>,
        page_size: usize,
    ) -> Self {
        Self {
            table,
            direction,
            to,
            page_size,
            current: Vec::new().into_iter(),
            next: NextPage::Start(from),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Starts fetching the page beginning at `from` in the background. Falls
    /// back to a foreground fetch if no thread can be spawned.
    fn prefetch(&self, from: Data) -> NextPage {
        let table = self.table.clone();
        let (direction, to, page_size) = (self.direction, self.to.clone(), self.page_size);
        let start = from.clone();
        let spawned = thread::Builder::new()
            .name("tabwire-prefetch".into())
            .spawn(move || table.fetch_page(direction, Some(start), to, page_size));
        match spawned {
            Ok(handle) => NextPage::InFlight(handle),
            Err(e) => {
                warn!("prefetch thread unavailable, fetching in the foreground: {e}");
                NextPage::Start(Some(from))
            }
        }
    }

    /// Blocks until the next page is available.
    fn take_page(&mut self) -> Option<Result<Page>> {
        match mem::replace(&mut self.next, NextPage::Done) {
            NextPage::Start(from) => Some(self.table.fetch_page(
                self.direction,
                from,
                self.to.clone(),
                self.page_size,
            )),
            NextPage::InFlight(handle) => Some(handle.join().unwrap_or(Err(Error::ScanAborted))),
            NextPage::Done => None,
        }
    }
}

impl Iterator for RemoteScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }

            let Page { mut rows, limit } = match self.take_page()? {
                Ok(page) => page,
                Err(e) => return Some(Err(e)),
            };
            trace!("scan received {} rows (limit {limit})", rows.len());

            if rows.len() >= limit.clamp(MIN_PAGE_SIZE, self.page_size) {
                if let Some((boundary, _)) = rows.pop() {
                    self.next = self.prefetch(boundary);
                }
            }
            self.current = rows.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        client::tests::{client, client_with},
        config::ClientConfig,
        data::DataType,
        protocol::Dispatcher,
        storage::{MemoryEngine, StorageEngine, Table},
    };

    fn keys(scan: RemoteScan) -> Vec<i64> {
        scan.map(|row| match row.unwrap().0 {
            Data::Int64(k) => k,
            other => panic!("unexpected key {other}"),
        })
        .collect()
    }

    #[test]
    fn pages_stitch_without_gaps_or_duplicates() {
        const ROWS: i64 = 250_000;
        for page_size in [100_000, 250_000, 300_000] {
            let (client, transport) = client(ClientConfig::default().with_page_size(page_size));
            let table = client.open_table("big", DataType::Int64, DataType::Int64).unwrap();

            let remote = transport.engine().table(table.descriptor().id).unwrap();
            for k in 1..=ROWS {
                remote.replace(Data::Int64(k), Data::Int64(k)).unwrap();
            }

            let scanned = keys(table.forward(None, None).unwrap());
            assert_eq!(scanned.len(), ROWS as usize, "page size {page_size}");
            assert!(
                scanned.iter().copied().eq(1..=ROWS),
                "page size {page_size}"
            );
        }
    }

    #[test]
    fn small_pages_in_both_directions() {
        for page_size in [2, 3, 7] {
            let (client, _) = client(ClientConfig::default().with_page_size(page_size));
            let table = client.open_table("t", DataType::Int64, DataType::String).unwrap();
            for k in 1..=20_i64 {
                table.replace(k, format!("v{k}")).unwrap();
            }

            assert_eq!(keys(table.forward(None, None).unwrap()), (1..=20).collect::<Vec<_>>());
            assert_eq!(
                keys(table.backward(None, None).unwrap()),
                (1..=20).rev().collect::<Vec<_>>()
            );
            assert_eq!(
                keys(table.forward(Some(Data::Int64(5)), Some(Data::Int64(12))).unwrap()),
                (5..=12).collect::<Vec<_>>()
            );
            assert_eq!(
                keys(table.backward(Some(Data::Int64(12)), Some(Data::Int64(5))).unwrap()),
                (5..=12).rev().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn exact_multiple_of_page_size() {
        let (client, _) = client(ClientConfig::default().with_page_size(5));
        let table = client.open_table("t", DataType::Int64, DataType::Int64).unwrap();
        for k in 1..=10_i64 {
            table.replace(k, k).unwrap();
        }
        assert_eq!(keys(table.forward(None, None).unwrap()), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn pages_cut_by_the_server_still_stitch() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryEngine::new())).with_page_bytes(4 * 1024);
        let (client, _) = client_with(ClientConfig::default(), dispatcher);
        let table = client.open_table("t", DataType::Int64, DataType::String).unwrap();
        let record = "r".repeat(300);
        for k in 1..=200_i64 {
            table.replace(k, record.as_str()).unwrap();
        }

        assert_eq!(keys(table.forward(None, None).unwrap()), (1..=200).collect::<Vec<_>>());
        assert_eq!(
            keys(table.backward(None, None).unwrap()),
            (1..=200).rev().collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_table_yields_nothing() {
        let (client, _) = client(ClientConfig::default());
        let table = client.open_table("t", DataType::Int64, DataType::Int64).unwrap();
        assert_eq!(table.forward(None, None).unwrap().count(), 0);
    }

    #[test]
    fn inverted_range_fails_before_any_request() {
        let (client, transport) = client(ClientConfig::default());
        let table = client.open_table("t", DataType::Int64, DataType::Int64).unwrap();
        let before = transport.calls();

        assert!(matches!(
            table.forward(Some(Data::Int64(10)), Some(Data::Int64(5))),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            table.backward(Some(Data::Int64(5)), Some(Data::Int64(10))),
            Err(Error::InvalidRange { .. })
        ));
        assert_eq!(transport.calls(), before);
    }

    #[test]
    fn abandoned_scan_leaves_table_usable() {
        let (client, _) = client(ClientConfig::default().with_page_size(4));
        let table = client.open_table("t", DataType::Int64, DataType::Int64).unwrap();
        for k in 1..=100_i64 {
            table.replace(k, k).unwrap();
        }

        let mut scan = table.forward(None, None).unwrap();
        assert_eq!(scan.next().unwrap().unwrap().0, Data::Int64(1));
        drop(scan);

        assert_eq!(table.count().unwrap(), 100);
    }
}
