use std::{
    collections::HashSet,
    ffi::OsString,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering::Relaxed},
};

use anyhow::{Context, bail, ensure};
use clap::Parser;
use indicatif::ParallelProgressIterator;
use itertools::Itertools;
use kmersketch::{
    EXTENSION, IdIndex, MergeSketch, RegisterWidth, Sketch, SketchParams,
    distance::{self, DistanceMatrix, Statistic},
};
use log::info;
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use serde::Serialize;

/// Sketch the k-mer content of sequence files, and compare k-mer sets.
#[derive(clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Takes paths to fasta/fastq files, and writes one .ksketch file per input.
    Sketch {
        #[command(flatten)]
        params: SketchParams,
        /// Paths to (directories of) fasta/fastq files (plain or gzipped).
        paths: Vec<PathBuf>,
        /// Also write the union of all sketches here.
        #[arg(long, short = 'o')]
        union: Option<PathBuf>,
        /// Also write the sorted distinct k-mer values of each input as .kmers files.
        #[arg(long)]
        kmers: bool,
        /// Do not write per-file sketches.
        #[arg(long)]
        no_save: bool,
        #[arg(long, short = 'j')]
        threads: Option<usize>,
    },
    /// Quantize continuous SetSketch files.
    Convert {
        /// .ksketch files holding continuous SetSketches.
        paths: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = RegisterWidth::Byte)]
        width: RegisterWidth,
        #[arg(long)]
        a: Option<f64>,
        #[arg(long)]
        b: Option<f64>,
        /// Derive a and b from the range of each sketch's registers.
        #[arg(long, conflicts_with_all = ["a", "b"])]
        optimal: bool,
        #[arg(long, short = 'j')]
        threads: Option<usize>,
    },
    /// Print the estimated cardinality of sketch files as JSON.
    Card {
        /// Paths to (directories of) .ksketch files.
        paths: Vec<PathBuf>,
        /// Write JSON output here, or default to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, short = 'j')]
        threads: Option<usize>,
    },
    /// Exact all-pairs statistic over .kmers files, written as a binary distance matrix.
    Dist {
        /// Paths to (directories of) .kmers files.
        paths: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = StatisticArg::Union)]
        statistic: StatisticArg,
        /// k-mer size, required for the mash distance.
        #[arg(short)]
        k: Option<usize>,
        /// Bits per stored value in the input files.
        #[arg(long, value_enum, default_value_t = ElementWidth::W64)]
        element_bits: ElementWidth,
        #[arg(long, short = 'o')]
        output: PathBuf,
        #[arg(long, short = 'j')]
        threads: Option<usize>,
    },
    /// Build an inverted index from k-mer values to the .kmers files containing them.
    Index {
        /// Paths to (directories of) .kmers files. Ids follow the sorted path order.
        paths: Vec<PathBuf>,
        /// Bits per stored value in the input files.
        #[arg(long, value_enum, default_value_t = ElementWidth::W64)]
        element_bits: ElementWidth,
        #[arg(long, short = 'o')]
        output: PathBuf,
        #[arg(long, short = 'j')]
        threads: Option<usize>,
    },
}

/// Size of one value in a .kmers file. Narrow values are zero-extended.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
enum ElementWidth {
    #[value(name = "16")]
    W16,
    #[value(name = "32")]
    W32,
    #[value(name = "64")]
    W64,
}

impl ElementWidth {
    fn bytes(self) -> usize {
        match self {
            ElementWidth::W16 => 2,
            ElementWidth::W32 => 4,
            ElementWidth::W64 => 8,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StatisticArg {
    Union,
    Jaccard,
    SymDiff,
    Mash,
}

const KMERS_EXTENSION: &str = "kmers";
const FASTX_EXTENSIONS: [&str; 7] = ["fa", "fasta", "fna", "fq", "fastq", "gz", "bgz"];

#[derive(Serialize)]
struct CardReport {
    path: String,
    kind: &'static str,
    registers: usize,
    cardinality: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    a: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    b: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overflow: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    // Initialize thread pool.
    let (Command::Sketch { threads, .. }
    | Command::Convert { threads, .. }
    | Command::Card { threads, .. }
    | Command::Dist { threads, .. }
    | Command::Index { threads, .. }) = &args.command;
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(*threads)
            .build_global()
            .context("failed to initialize the thread pool")?;
    }

    match &args.command {
        Command::Sketch {
            params,
            paths,
            union,
            kmers,
            no_save,
            ..
        } => sketch(params, paths, union.as_deref(), *kmers, !no_save),
        Command::Convert {
            paths,
            width,
            a,
            b,
            optimal,
            ..
        } => convert(paths, *width, *a, *b, *optimal),
        Command::Card { paths, output, .. } => card(paths, output.as_deref()),
        Command::Dist {
            paths,
            statistic,
            k,
            element_bits,
            output,
            ..
        } => {
            let statistic = match statistic {
                StatisticArg::Union => Statistic::UnionSize,
                StatisticArg::Jaccard => Statistic::Jaccard,
                StatisticArg::SymDiff => Statistic::SymmetricDifference,
                StatisticArg::Mash => {
                    let Some(k) = k else {
                        bail!("the mash distance needs the k-mer size (-k)");
                    };
                    Statistic::MashDistance(*k)
                }
            };
            dist(paths, statistic, *element_bits, output)
        }
        Command::Index {
            paths,
            element_bits,
            output,
            ..
        } => index(paths, *element_bits, output),
    }
}

fn progress_style() -> anyhow::Result<indicatif::ProgressStyle> {
    Ok(indicatif::ProgressStyle::with_template(
        "{msg:.bold} [{elapsed_precise:.cyan}] {bar} {pos}/{len} ({percent:>3}%)",
    )?
    .progress_chars("##-"))
}

fn sketch(
    params: &SketchParams,
    paths: &[PathBuf],
    union: Option<&Path>,
    dump_kmers: bool,
    save: bool,
) -> anyhow::Result<()> {
    let paths = collect_paths(paths, &FASTX_EXTENSIONS)?;
    let q = paths.len();
    let sketcher = params.build()?;

    let start = std::time::Instant::now();
    let total_bytes = AtomicUsize::new(0);
    let total_kmers = AtomicUsize::new(0);

    let mut sketches: Vec<Sketch> = paths
        .par_iter()
        .progress_with_style(progress_style()?)
        .with_message("Sketching")
        .with_finish(indicatif::ProgressFinish::AndLeave)
        .map(|path| -> anyhow::Result<Sketch> {
            let mut reader = needletail::parse_fastx_file(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let mut source = sketcher.source();
            let mut sketch = sketcher.new_sketch();
            let mut kmers = vec![];
            while let Some(record) = reader.next() {
                let record =
                    record.with_context(|| format!("failed to parse {}", path.display()))?;
                let seq = record.seq();
                total_bytes.fetch_add(seq.len(), Relaxed);
                let mut count = 0;
                source.for_each_hash(&seq, |value| {
                    count += 1;
                    sketch.update(value);
                    if dump_kmers {
                        kmers.push(value);
                    }
                });
                total_kmers.fetch_add(count, Relaxed);
            }

            if save {
                let out = add_extension(path, EXTENSION);
                sketch
                    .save(&out)
                    .with_context(|| format!("failed to write {}", out.display()))?;
            }
            if dump_kmers {
                kmers.sort_unstable();
                kmers.dedup();
                let out = add_extension(path, KMERS_EXTENSION);
                write_kmers(&out, &kmers)
                    .with_context(|| format!("failed to write {}", out.display()))?;
            }
            Ok(sketch)
        })
        .collect::<anyhow::Result<_>>()?;
    let t_sketch = start.elapsed();

    info!(
        "Sketching {q} files took {t_sketch:?} ({:?} avg, {} MiB/s)",
        t_sketch / q.max(1) as u32,
        total_bytes.into_inner() as f32 / t_sketch.as_secs_f32() / (1 << 20) as f32
    );
    info!("Fed {} k-mers into the sketches.", total_kmers.into_inner());
    if save {
        info!("Wrote {q} sketches to disk.");
    }

    if let Some(union) = union {
        ensure!(!sketches.is_empty(), "no input files to take the union of");
        let start = std::time::Instant::now();
        distance::par_reduce(&mut sketches, |a, b| a.merge(b))?;
        let merged = &sketches[0];
        info!(
            "Merging {q} sketches took {:?}; union cardinality ~{:.0}",
            start.elapsed(),
            merged.cardinality()
        );
        merged
            .save(union)
            .with_context(|| format!("failed to write {}", union.display()))?;
    }
    Ok(())
}

fn convert(
    paths: &[PathBuf],
    width: RegisterWidth,
    a: Option<f64>,
    b: Option<f64>,
    optimal: bool,
) -> anyhow::Result<()> {
    let suffix = format!("{width:?}").to_lowercase();
    let output_of = |path: &Path| path.with_extension(format!("{suffix}.{EXTENSION}"));
    let mut paths = collect_paths(paths, &[EXTENSION])?;
    // Outputs of an earlier run are rewritten below, never read.
    let outputs: HashSet<PathBuf> = paths.iter().map(|path| output_of(path)).collect();
    paths.retain(|path| !outputs.contains(path));
    let (default_a, default_b) = width.default_params();
    let converted = AtomicUsize::new(0);

    paths
        .par_iter()
        .progress_with_style(progress_style()?)
        .with_message("Converting")
        .with_finish(indicatif::ProgressFinish::AndLeave)
        .try_for_each(|path| -> anyhow::Result<()> {
            let sketch =
                Sketch::load(path).with_context(|| format!("failed to read {}", path.display()))?;
            let Sketch::Continuous(sketch) = sketch else {
                log::warn!(
                    "Skipping {}: it holds a {} sketch, not a continuous SetSketch.",
                    path.display(),
                    sketch.kind()
                );
                return Ok(());
            };
            let (a, b) = if optimal {
                sketch.optimal_parameters(width.q())?
            } else {
                (a.unwrap_or(default_a), b.unwrap_or(default_b))
            };
            let quantized = Sketch::Quantized(sketch.quantize(a, b, width)?);
            let out = output_of(path);
            quantized
                .save(&out)
                .with_context(|| format!("failed to write {}", out.display()))?;
            log::debug!("Converted {} with a={a} b={b}", path.display());
            converted.fetch_add(1, Relaxed);
            Ok(())
        })?;
    info!(
        "Converted {} of {} sketches to {suffix} registers.",
        converted.into_inner(),
        paths.len()
    );
    Ok(())
}

fn card(paths: &[PathBuf], output: Option<&Path>) -> anyhow::Result<()> {
    let paths = collect_paths(paths, &[EXTENSION])?;
    let reports: Vec<CardReport> = paths
        .par_iter()
        .map(|path| -> anyhow::Result<CardReport> {
            let sketch =
                Sketch::load(path).with_context(|| format!("failed to read {}", path.display()))?;
            let (registers, a, b, overflow) = match &sketch {
                Sketch::Hll(s) => (s.registers().len(), None, None, None),
                Sketch::Bottom(s) => (s.k(), None, None, None),
                Sketch::Continuous(s) => (s.m(), None, None, None),
                Sketch::Quantized(s) => {
                    (s.m(), Some(s.a()), Some(s.b()), Some(s.overflow_count()))
                }
            };
            Ok(CardReport {
                path: path.to_string_lossy().to_string(),
                kind: sketch.kind(),
                registers,
                cardinality: sketch.cardinality(),
                a,
                b,
                overflow,
            })
        })
        .collect::<anyhow::Result<_>>()?;

    let json = serde_json::to_string_pretty(&reports)?;
    match output {
        Some(output) => std::fs::write(output, json)
            .with_context(|| format!("failed to write {}", output.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn dist(
    paths: &[PathBuf],
    statistic: Statistic,
    width: ElementWidth,
    output: &Path,
) -> anyhow::Result<()> {
    let paths = collect_paths(paths, &[KMERS_EXTENSION])?;
    let sets = load_kmer_sets(&paths, width)?;
    let q = sets.len();

    let start = std::time::Instant::now();
    let matrix = DistanceMatrix::compute(&sets, statistic);
    let t_dist = start.elapsed();
    let cnt = q * q.saturating_sub(1) / 2;
    info!(
        "Computing {cnt} pairs of {statistic:?} took {t_dist:?} ({:?} avg)",
        t_dist / cnt.max(1) as u32
    );

    matrix
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

fn index(paths: &[PathBuf], width: ElementWidth, output: &Path) -> anyhow::Result<()> {
    let paths = collect_paths(paths, &[KMERS_EXTENSION])?;
    ensure!(
        u32::try_from(paths.len()).is_ok(),
        "at most {} sets can be indexed",
        u32::MAX
    );
    let sets = load_kmer_sets(&paths, width)?;

    let start = std::time::Instant::now();
    let mut shards: Vec<IdIndex> = sets
        .par_iter()
        .enumerate()
        .map(|(id, kmers)| {
            let mut shard = IdIndex::new();
            shard.insert_set(id as u32, kmers.iter().copied());
            shard
        })
        .collect();
    distance::par_reduce(&mut shards, |a, b| {
        a.merge(b);
        Ok(())
    })?;
    let index = shards.into_iter().next().unwrap_or_default();
    info!(
        "Indexing {} sets took {:?}: {} keys, {} ids",
        paths.len(),
        start.elapsed(),
        index.len(),
        index.total_ids()
    );

    index
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    for (id, path) in paths.iter().enumerate() {
        log::debug!("set {id}: {}", path.display());
    }
    Ok(())
}

fn load_kmer_sets(paths: &[PathBuf], width: ElementWidth) -> anyhow::Result<Vec<Vec<u64>>> {
    paths
        .par_iter()
        .progress_with_style(progress_style()?)
        .with_message("Reading")
        .with_finish(indicatif::ProgressFinish::AndLeave)
        .map(|path| {
            read_kmers(path, width).with_context(|| format!("failed to read {}", path.display()))
        })
        .collect()
}

/// Sorted, distinct values as consecutive little-endian `u64`s.
fn write_kmers(path: &Path, kmers: &[u64]) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for kmer in kmers {
        out.write_all(&kmer.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

fn read_kmers(path: &Path, width: ElementWidth) -> anyhow::Result<Vec<u64>> {
    let bytes = std::fs::read(path)?;
    let size = width.bytes();
    ensure!(
        bytes.len() % size == 0,
        "length {} is not a multiple of {size}",
        bytes.len()
    );
    let kmers = bytes
        .chunks_exact(size)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word[..size].copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect_vec();
    ensure!(
        kmers.is_sorted_by(|a, b| a < b),
        "k-mer values are not sorted and distinct"
    );
    Ok(kmers)
}

/// `genome.fa` -> `genome.fa.<ext>`.
fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    name.into()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Expand directories one level deep, keeping files with one of `extensions`.
fn collect_paths(paths: &[PathBuf], extensions: &[&str]) -> anyhow::Result<Vec<PathBuf>> {
    let mut res = vec![];
    for path in paths {
        if path.is_dir() {
            for entry in path
                .read_dir()
                .with_context(|| format!("failed to list {}", path.display()))?
            {
                res.push(entry?.path());
            }
        } else {
            res.push(path.clone());
        }
    }
    res.sort();

    res.retain(|p| extensions.iter().any(|ext| has_extension(p, ext)));
    Ok(res)
}
