use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use unwind_forge::{BlobKind, UnwindCompiler, VecSink};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Object file to compile an unwind table for (repeatable)
    #[arg(short, long)]
    binary: Vec<PathBuf>,

    /// Process whose address space to compose (repeatable)
    #[arg(short, long)]
    pid: Vec<u32>,

    /// Directory to write the emitted blobs into; without it only a
    /// summary is printed
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();
    if opt.binary.is_empty() && opt.pid.is_empty() {
        anyhow::bail!("nothing to do: pass --binary and/or --pid");
    }

    let mut compiler = UnwindCompiler::new(VecSink::new());
    for path in &opt.binary {
        compiler.add_object_file(path)?;
        println!("compiled {}", path.display());
    }
    for &pid in &opt.pid {
        compiler.add_pid(pid)?;
        println!("composed mappings for pid {pid}");
    }

    let sink = compiler.into_sink();
    if let Some(dir) = &opt.out {
        fs::create_dir_all(dir)?;
        for (kind, key, bytes) in &sink.blobs {
            let name = match kind {
                BlobKind::UnwindEntries => format!("entry-{key:08}.bin"),
                BlobKind::Expressions => format!("expr-{key:08}.bin"),
                BlobKind::UnwindTable => format!("table-{key:08}.bin"),
                BlobKind::Mappings => format!("mappings-{key}.bin"),
            };
            fs::write(dir.join(name), bytes)?;
        }
        println!("wrote {} blobs to {}", sink.blobs.len(), dir.display());
    } else {
        let mut counts: HashMap<BlobKind, (usize, usize)> = HashMap::new();
        for (kind, _, bytes) in &sink.blobs {
            let slot = counts.entry(*kind).or_default();
            slot.0 += 1;
            slot.1 += bytes.len();
        }
        for (kind, (count, total)) in counts {
            println!("{kind:?}: {count} blobs, {total} bytes");
        }
    }
    Ok(())
}
