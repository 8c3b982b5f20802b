//! End-to-end scenarios across both I/O paths.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

const DIMS: usize = 5;
const ROW: usize = DIMS * 8;
const ROWS: usize = 300;
const UNASSIGNED: usize = usize::MAX;

/// Centers plus the cluster each point ends up in.
struct KMeans {
    centers: Vec<[f64; DIMS]>,
    assign: Vec<AtomicUsize>,
}

impl KMeans {
    fn new() -> Arc<Self> {
        Arc::new(KMeans {
            centers: vec![[1.0; DIMS], [5.0; DIMS], [9.0; DIMS]],
            assign: (0..ROWS).map(|_| AtomicUsize::new(UNASSIGNED)).collect(),
        })
    }

    fn nearest(&self, p: &[f64; DIMS]) -> usize {
        let dist = |c: &[f64; DIMS]| -> f64 { c.iter().zip(p).map(|(a, b)| (a - b) * (a - b)).sum() };
        (0..self.centers.len())
            .min_by(|&a, &b| dist(&self.centers[a]).total_cmp(&dist(&self.centers[b])))
            .unwrap_or(0)
    }

    fn assignments(&self) -> Vec<usize> {
        self.assign.iter().map(|a| a.load(Ordering::Relaxed)).collect()
    }
}

fn value(row: usize, dim: usize) -> f64 {
    ((row * 7 + dim * 13) % 101) as f64 / 10.0
}

fn dataset() -> Vec<u8> {
    let mut data = Vec::with_capacity(ROWS * ROW);
    for r in 0..ROWS {
        for d in 0..DIMS {
            data.extend_from_slice(&value(r, d).to_le_bytes());
        }
    }
    data
}

fn data_file() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&dataset()).unwrap();
    f.flush().unwrap();
    f
}

fn parse(page: &dyn PageByteArray) -> [f64; DIMS] {
    let mut raw = [0u8; ROW];
    assert_eq!(page.copy_to(&mut raw), ROW);
    let mut row = [0.0; DIMS];
    for (d, v) in row.iter_mut().enumerate() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[d * 8..d * 8 + 8]);
        *v = f64::from_le_bytes(b);
    }
    row
}

/// Assigns the midpoint of its own row and the next row. The second row
/// is only requested once the first has arrived.
struct Point {
    id: usize,
    own: Option<[f64; DIMS]>,
}

impl ComputeVertex<KMeans> for Point {
    fn run(&mut self, _: &KMeans, want: &mut Vec<Extent>) {
        want.push(Extent::new((self.id * ROW) as u64, ROW));
    }

    fn run_on_page(&mut self, prog: &KMeans, page: &dyn PageByteArray, want: &mut Vec<Extent>) {
        let row = parse(page);
        match self.own {
            None => {
                self.own = Some(row);
                let next = (self.id + 1) % ROWS;
                want.push(Extent::new((next * ROW) as u64, ROW));
            }
            Some(own) => {
                let mut mid = [0.0; DIMS];
                for d in 0..DIMS {
                    mid[d] = (own[d] + row[d]) / 2.0;
                }
                prog.assign[self.id].store(prog.nearest(&mid), Ordering::Relaxed);
            }
        }
    }
}

fn expected() -> Vec<usize> {
    let prog = KMeans::new();
    (0..ROWS)
        .map(|i| {
            let j = (i + 1) % ROWS;
            let mut mid = [0.0; DIMS];
            for (d, m) in mid.iter_mut().enumerate() {
                *m = (value(i, d) + value(j, d)) / 2.0;
            }
            prog.nearest(&mid)
        })
        .collect()
}

/// Run every point through `factory`; returns assignments and pool stats.
fn cluster(factory: &dyn IoFactory) -> (Vec<usize>, PoolStats) {
    let prog = KMeans::new();
    let pool = ComputePool::new("kmeans", ROWS);
    let mut io = factory.create_io(0).unwrap();

    for id in 0..ROWS {
        let c = pool
            .alloc(Box::new(VertexCompute::new(Point { id, own: None }, Arc::clone(&prog))))
            .unwrap();
        submit_compute(&mut *io, &c, 8);
        if id % 32 == 0 {
            io.wait4complete(0);
        }
    }
    while io.num_pending_ios() > 0 {
        io.wait4complete(1);
    }
    io.wait4complete(0);
    (prog.assignments(), pool.stats())
}

fn assert_conserved(stats: PoolStats) {
    assert_eq!(stats.allocs, ROWS as u64);
    assert_eq!(stats.reclaims, ROWS as u64);
    assert_eq!(stats.incs, stats.decs);
    assert_eq!(stats.live, 0);
}

#[test]
fn test_in_memory_matches_expected() {
    let image = InMemImage::from_bytes(FileId(1), "kmeans", &dataset()).unwrap();
    let factory = image.create_io_factory(&IoConfig::new());
    let (assign, stats) = cluster(factory.as_ref());
    assert_eq!(assign, expected());
    assert_conserved(stats);
}

#[test]
fn test_disk_and_memory_paths_agree() {
    let file = data_file();
    let config = IoConfig::new().num_io_threads(2).sender_buf_size(4).io_batch(4);
    let system = IoSystem::new(config.clone()).unwrap();

    let shared = system.open_file(file.path(), FileLayout::Shared).unwrap();
    let (from_shared, stats) = cluster(shared.as_ref());
    assert_conserved(stats);

    let striped = system
        .open_file(file.path(), FileLayout::Striped { block_size: PAGE_SIZE as u64 })
        .unwrap();
    assert_ne!(striped.file_id(), shared.file_id());
    let (from_striped, stats) = cluster(striped.as_ref());
    assert_conserved(stats);

    let image = InMemImage::load(shared.as_ref(), &config).unwrap();
    assert_eq!(image.as_slice(), &dataset()[..]);
    let (from_mem, _) = cluster(image.create_io_factory(&config).as_ref());

    assert_eq!(from_shared, from_mem);
    assert_eq!(from_striped, from_mem);
    assert_eq!(from_mem, expected());

    let total = system.total_stats();
    assert_eq!(total.io_errors, 0);
    assert_eq!(total.accesses, total.completed);
    assert!(system.stats().iter().all(|s| s.accesses > 0));
    system.shutdown();
}

#[test]
fn test_uring_engine_agrees() {
    let file = data_file();
    let config = IoConfig::new().num_io_threads(2).engine(EngineKind::Uring);
    // Kernels or sandboxes without io_uring
    let Ok(system) = IoSystem::new(config) else { return };
    let factory = system.open_file(file.path(), FileLayout::Shared).unwrap();
    let (assign, stats) = cluster(factory.as_ref());
    assert_eq!(assign, expected());
    assert_conserved(stats);
}

#[test]
fn test_chunked_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..5 * PAGE_SIZE + 123).map(|i| (i * 31 % 256) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let config = IoConfig::new().num_io_threads(1).max_load_chunk(2 * PAGE_SIZE);
    let system = IoSystem::new(config).unwrap();
    let factory = system.load_in_mem(file.path()).unwrap();
    assert_eq!(factory.file_size(), data.len() as u64);
    assert_eq!(factory.image().as_slice(), &data[..]);
    assert_eq!(factory.image().num_pages(), 6);
    assert_eq!(system.total_stats().accesses, 3);
}

#[test]
fn test_load_reports_short_read() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 1000]).unwrap();
    file.flush().unwrap();

    let config = IoConfig::new().num_io_threads(1);
    let system = IoSystem::new(config.clone()).unwrap();
    let real = system.open_file(file.path(), FileLayout::Shared).unwrap();
    // Claims more bytes than the file holds
    let partition = FilePartition::new(real.file_id(), file.path(), 4000, FileLayout::Shared, 1);
    let lying = RemoteIoFactory::new(partition, vec![system.disk(0).unwrap()], config.clone());

    let err = InMemImage::load(&lying, &config).unwrap_err();
    assert_eq!(err, IoError::ShortRead { offset: 0, expected: 4000, got: 1000 });
}

#[test]
fn test_low_priority_reads_complete_or_drop() {
    let file = data_file();
    let config = IoConfig::new().num_io_threads(2).low_prio_batch(2);
    let system = IoSystem::new(config).unwrap();
    let factory = system.open_file(file.path(), FileLayout::Shared).unwrap();
    let mut io = factory.create_remote_io(0);

    let mut bufs = vec![vec![0u8; ROW]; 20];
    let mut reqs: Vec<_> = bufs
        .iter_mut()
        .enumerate()
        .map(|(i, b)| Request::with_buffer(factory.file_id(), (i * ROW) as u64, unsafe { Fragment::from_slice(b) }, Access::Read))
        .collect();
    io.access_low_prio(&mut reqs);

    let mut done = Vec::new();
    while io.num_pending_ios() > 0 {
        io.wait4complete(1);
    }
    io.take_completed(&mut done);
    assert_eq!(done.len(), 20);
    assert!(done.iter().all(|r| r.priority() == Priority::Low));

    let served = done.iter().filter(|r| r.status() == IoStatus::Done(ROW)).count() as u64;
    let dropped = done.iter().filter(|r| r.status() == IoStatus::Dropped).count() as u64;
    assert_eq!(served + dropped, 20);
    let total = system.total_stats();
    assert_eq!(total.low_prio_accesses, served);
    assert_eq!(total.ignored_low_prio, dropped);

    let data = dataset();
    for r in done.iter().filter(|r| r.status().is_done()) {
        let off = r.offset() as usize;
        let i = off / ROW;
        assert_eq!(&bufs[i][..], &data[off..off + ROW]);
    }
}

#[test]
fn test_open_missing_file_fails() {
    let system = IoSystem::new(IoConfig::new().num_io_threads(1)).unwrap();
    let err = system.open_file("/nonexistent/pageio/file", FileLayout::Shared).err();
    assert!(matches!(err, Some(IoError::Os(_))));
    assert!(matches!(
        IoSystem::new(IoConfig::new().num_io_threads(0)).err(),
        Some(IoError::Config(_))
    ));
}
