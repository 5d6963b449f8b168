//! Fill/read micro-benchmark for the storage engine.

use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use stratadb::{Database, Options, ReadOptions, WriteOptions};
use tempfile::TempDir;

const NUM_KVS: usize = 200_000;
const KEY_SIZE: usize = 16;
const VALUE_SIZE: usize = 100;
const RAW_SIZE_MB: f64 = ((KEY_SIZE + VALUE_SIZE) * NUM_KVS) as f64 / 1024.0 / 1024.0;

fn print_arguments() {
    println!("StrataDB: version {}", env!("CARGO_PKG_VERSION"));
    println!("Keys: {} bytes each", KEY_SIZE);
    println!("Values: {} bytes each", VALUE_SIZE);
    println!("Entries: {}", NUM_KVS);
    println!("RawSize: {:.1} MB (estimated)", RAW_SIZE_MB);
    println!();
}

struct BenchMark {
    _temp_dir: TempDir,
    db: Database,
}

impl BenchMark {
    fn new() -> BenchMark {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let db = Database::open(temp_dir.path(), Options::default()).expect("open database");
        BenchMark {
            _temp_dir: temp_dir,
            db,
        }
    }

    fn report(name: &str, start: Instant, ops: usize) {
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "{:<14} {:>10.3} micros/op; {:>8.1} MB/s",
            name,
            elapsed * 1e6 / ops as f64,
            RAW_SIZE_MB / elapsed
        );
    }

    fn key(&self, i: usize) -> Vec<u8> {
        format!("{:0width$}", i, width = KEY_SIZE).into_bytes()
    }

    fn fill_seq(&self) {
        let wo = WriteOptions::default();
        let value = vec![b'v'; VALUE_SIZE];
        let start = Instant::now();
        for i in 0..NUM_KVS {
            self.db.put(&wo, &self.key(i), &value).expect("put");
        }
        Self::report("fillseq", start, NUM_KVS);
    }

    fn fill_random(&self) {
        let wo = WriteOptions::default();
        let value = vec![b'v'; VALUE_SIZE];
        let mut rng = StdRng::seed_from_u64(0x517a7ada);
        let dist = Uniform::new(0, NUM_KVS);
        let start = Instant::now();
        for _ in 0..NUM_KVS {
            let i = rng.sample(dist);
            self.db.put(&wo, &self.key(i), &value).expect("put");
        }
        Self::report("fillrandom", start, NUM_KVS);
    }

    fn read_seq(&self) {
        let ro = ReadOptions::default();
        let start = Instant::now();
        let mut found = 0;
        for i in 0..NUM_KVS {
            if self.db.get(&ro, &self.key(i)).expect("get").is_some() {
                found += 1;
            }
        }
        Self::report("readseq", start, NUM_KVS);
        println!("  ({} of {} found)", found, NUM_KVS);
    }

    fn read_random(&self) {
        let ro = ReadOptions::default();
        let mut rng = StdRng::seed_from_u64(0x517a7ada);
        let dist = Uniform::new(0, NUM_KVS * 2);
        let start = Instant::now();
        let mut found = 0;
        for _ in 0..NUM_KVS {
            let i = rng.sample(dist);
            if self.db.get(&ro, &self.key(i)).expect("get").is_some() {
                found += 1;
            }
        }
        Self::report("readrandom", start, NUM_KVS);
        println!("  ({} of {} found)", found, NUM_KVS);
    }
}

fn main() {
    print_arguments();

    let bench = BenchMark::new();
    bench.fill_seq();
    bench.read_seq();
    bench.read_random();
    drop(bench);

    let bench = BenchMark::new();
    bench.fill_random();
    bench.read_random();
}
