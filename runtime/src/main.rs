use clap::Parser as ClapParser;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    process,
    sync::Arc,
    time::Instant,
};

use heap::sizeclass::WORD;
use runtime::{FuncId, FuncInfo, PtrMap, Runtime, RuntimeConfig, Semaphore, TaskContext};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Runs allocation-heavy tasks on the runtime", long_about = None)]
struct Cli {
    /// Execution slots (defaults to the number of CPUs)
    #[arg(long)]
    procs: Option<usize>,

    /// Tasks to spawn
    #[arg(long, default_value_t = 8)]
    tasks: usize,

    /// List nodes each task allocates
    #[arg(long, default_value_t = 10_000)]
    objects: usize,

    /// Heap growth between cycles in percent, negative disables the pacer
    #[arg(long, allow_hyphen_values = true)]
    gcpercent: Option<i32>,

    /// Write a heap dump here when done
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Print runtime metrics when done
    #[arg(long)]
    metrics: bool,
}

/// Node layout: `[next, value]`, only `next` is a pointer.
const NODE_PTRS: [u64; 1] = [0b01];

fn build_list(cx: &TaskContext, func: FuncId, n: usize) -> usize {
    cx.push_frame(func);
    for i in 0..n {
        let head = cx.local(0);
        let node = cx.alloc(2 * WORD, PtrMap::Bits(&NODE_PTRS));
        // SAFETY: node is a fresh two-word object, word 0 a pointer
        unsafe {
            cx.store_ptr(node, head);
            cx.store_word(node + WORD, i);
        }
        cx.set_local(0, node);
    }
    let mut len = 0;
    let mut p = cx.local(0);
    while p != 0 {
        len += 1;
        // SAFETY: p is a node reachable from local 0
        p = unsafe { cx.load_ptr(p) };
    }
    cx.pop_frame();
    len
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", runtime::config::ENV_VAR);
            process::exit(2);
        }
    };
    if let Some(procs) = cli.procs {
        config.procs = procs.max(1);
    }
    if let Some(percent) = cli.gcpercent {
        config.gc_percent = percent;
    }

    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("cannot start runtime: {err}");
            process::exit(1);
        }
    };
    let func = rt.register_func(FuncInfo::new("build_list", 1).pointers(&[0b1]));

    let start = Instant::now();
    let (ntasks, nobjects) = (cli.tasks, cli.objects);
    let result = rt.block_on(move |cx| async move {
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..ntasks {
            let done = done.clone();
            let spawned = cx.spawn(move |cx| async move {
                let mut total = 0;
                // Several rounds so earlier lists become garbage.
                for _ in 0..4 {
                    total += build_list(&cx, func, nobjects);
                    cx.safepoint().await;
                }
                log::debug!("task {} built {total} nodes", cx.goid());
                done.release(&cx);
                Ok(())
            });
            if let Err(err) = spawned {
                return Err(cx.exception(format!("spawn: {err}"), 0));
            }
        }
        for _ in 0..ntasks {
            done.acquire(&cx).await;
        }
        Ok(ntasks * nobjects * 4)
    });
    let nodes = match result {
        Ok(nodes) => nodes,
        Err(err) => {
            eprintln!("workload failed: {err}");
            process::exit(1);
        }
    };
    rt.gc();
    println!(
        "allocated {nodes} nodes on {} tasks in {:?}",
        ntasks,
        start.elapsed()
    );

    if let Some(path) = &cli.dump {
        let written = File::create(path)
            .map_err(heap::DumpError::from)
            .and_then(|f| rt.dump_heap(BufWriter::new(f)));
        match written {
            Ok(()) => println!("heap dump written to {}", path.display()),
            Err(err) => {
                eprintln!("cannot write heap dump: {err}");
                process::exit(1);
            }
        }
    }

    if cli.metrics {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for (name, value) in rt.metrics() {
            let _ = writeln!(out, "{name:<32} {value}");
        }
    }
}
