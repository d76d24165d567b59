//! Mixed reader/writer workload against the page cache.
//!
//! Writers stamp pages with a self-checking triple; readers verify it through
//! the optimistic read protocol. Any triple that fails to check after
//! `should_retry()` returned false is reported as a torn read.

use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::Color;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sombra_pagecache::{
    AccessMode, CursorContext, PageCache, PageCacheOptions, PageCacheStats, PageId, PagedFile,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pagecache-stress",
    version,
    about = "Concurrent reader/writer stress test for the Sombra page cache"
)]
struct Cli {
    #[arg(long, value_name = "DIR", help = "Directory for the data file (temporary if omitted)")]
    dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "TOML file with page cache options")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override cache page size (bytes)")]
    page_size: Option<usize>,

    #[arg(long, help = "Override cache size (pages)")]
    cache_pages: Option<usize>,

    #[arg(long, default_value_t = 256, help = "Pages in the data file")]
    pages: u64,

    #[arg(long, default_value_t = 2, help = "Writer threads")]
    writers: usize,

    #[arg(long, default_value_t = 4, help = "Reader threads")]
    readers: usize,

    #[arg(long, default_value_t = 5, help = "Run time in seconds")]
    seconds: u64,

    #[arg(long, default_value_t = 42, env = "PAGECACHE_STRESS_SEED")]
    seed: u64,

    #[arg(long, value_enum, default_value_t = WriteMode::Exclusive)]
    write_mode: WriteMode,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WriteMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    reads: AtomicU64,
    retries: AtomicU64,
    torn: AtomicU64,
}

#[derive(Serialize)]
struct Report {
    seconds: f64,
    writes: u64,
    reads: u64,
    retries: u64,
    torn_reads: u64,
    cache: PageCacheStats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut options = match &cli.config {
        Some(path) => PageCacheOptions::load(path)?,
        None => PageCacheOptions::default(),
    };
    if let Some(page_size) = cli.page_size {
        options.page_size = page_size;
    }
    if let Some(pages) = cli.cache_pages {
        options.cache_pages = Some(pages);
        options.cache_bytes = None;
    }

    let tmp;
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => {
            tmp = tempfile::tempdir()?;
            tmp.path().to_path_buf()
        }
    };
    let page_size = options.page_size;
    let cache = Arc::new(PageCache::new(options)?);
    let file = Arc::new(cache.map(dir.join("stress.db"), page_size)?);
    seed_pages(&file, cli.pages)?;

    let counters = Arc::new(Counters::default());
    let stop = Arc::new(AtomicBool::new(false));
    let write_mode = match cli.write_mode {
        WriteMode::Shared => AccessMode::SharedWrite,
        WriteMode::Exclusive => AccessMode::Exclusive,
    };

    let mut workers = Vec::new();
    for idx in 0..cli.writers {
        let (file, counters, stop) = (file.clone(), counters.clone(), stop.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(cli.seed ^ (idx as u64 + 1));
        let writers = cli.writers as u64;
        // Each writer owns the pages congruent to its index.
        let slots = (cli.pages / writers).max(1);
        workers.push(thread::spawn(move || -> sombra_pagecache::Result<()> {
            let ctx = CursorContext::none();
            let mut cursor = file.io(0u64, write_mode, &ctx)?;
            let mut serial = idx as u64 * 1_000_000_000;
            while !stop.load(Ordering::Relaxed) {
                let page = rng.gen_range(0..slots) * writers + idx as u64;
                cursor.next_page(page)?;
                serial += 1;
                write_triple(&mut cursor, page, serial);
                counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            cursor.close();
            Ok(())
        }));
    }
    for idx in 0..cli.readers {
        let (file, counters, stop) = (file.clone(), counters.clone(), stop.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(cli.seed.wrapping_mul(31) ^ (idx as u64 + 7));
        let pages = cli.pages;
        workers.push(thread::spawn(move || -> sombra_pagecache::Result<()> {
            let ctx = CursorContext::none();
            let mut cursor = file.io(0u64, AccessMode::SharedRead, &ctx)?;
            while !stop.load(Ordering::Relaxed) {
                let page = rng.gen_range(0..pages);
                if !cursor.next_page(page)? {
                    continue;
                }
                let triple = loop {
                    let triple = (
                        cursor.get_u64_at(0),
                        cursor.get_u64_at(8),
                        cursor.get_u64_at(16),
                    );
                    if !cursor.should_retry()? {
                        break triple;
                    }
                    counters.retries.fetch_add(1, Ordering::Relaxed);
                };
                if triple.0 != page || triple.0 ^ triple.1 != triple.2 {
                    counters.torn.fetch_add(1, Ordering::Relaxed);
                }
                counters.reads.fetch_add(1, Ordering::Relaxed);
            }
            cursor.close();
            Ok(())
        }));
    }

    let started = Instant::now();
    let deadline = Duration::from_secs(cli.seconds);
    let progress = if std::io::stderr().is_terminal() {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };
    while started.elapsed() < deadline {
        thread::sleep(Duration::from_millis(200));
        if let Some(pb) = &progress {
            pb.set_message(format!(
                "{} writes, {} reads",
                counters.writes.load(Ordering::Relaxed),
                counters.reads.load(Ordering::Relaxed)
            ));
        }
    }
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().map_err(|_| "worker thread panicked")??;
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    cache.flush_and_force()?;
    let report = Report {
        seconds: started.elapsed().as_secs_f64(),
        writes: counters.writes.load(Ordering::Relaxed),
        reads: counters.reads.load(Ordering::Relaxed),
        retries: counters.retries.load(Ordering::Relaxed),
        torn_reads: counters.torn.load(Ordering::Relaxed),
        cache: cache.stats(),
    };
    cache.close()?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    if report.torn_reads > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn seed_pages(file: &PagedFile, pages: u64) -> sombra_pagecache::Result<()> {
    let mut cursor = file.io(0u64, AccessMode::Exclusive, &CursorContext::none())?;
    for page in 0..pages {
        cursor.next_page(PageId(page))?;
        write_triple(&mut cursor, page, 0);
    }
    cursor.close();
    file.flush()
}

fn write_triple(cursor: &mut sombra_pagecache::PageCursor, page: u64, serial: u64) {
    cursor.put_u64_at(0, page);
    cursor.put_u64_at(8, serial);
    cursor.put_u64_at(16, page ^ serial);
}

fn print_report(report: &Report) {
    let paint = std::io::stdout().is_terminal();
    let verdict = if report.torn_reads == 0 {
        "ok"
    } else {
        "TORN READS"
    };
    let verdict = match (paint, report.torn_reads) {
        (true, 0) => Color::Green.bold().paint(verdict).to_string(),
        (true, _) => Color::Red.bold().paint(verdict).to_string(),
        (false, _) => verdict.to_string(),
    };
    println!("pagecache-stress: {verdict}");
    println!("  {:>10}: {:.2}s", "elapsed", report.seconds);
    println!("  {:>10}: {}", "writes", report.writes);
    println!("  {:>10}: {}", "reads", report.reads);
    println!("  {:>10}: {}", "retries", report.retries);
    println!("  {:>10}: {}", "torn", report.torn_reads);
    println!("  {:>10}: {}", "cache", report.cache);
    println!("  {:>10}: {:.3}", "hit ratio", report.cache.hit_ratio());
}
