use clap::Parser;

use conv_bench::{reference_output, BenchPath, BenchReport, ConvBench};
use sconv_dev::{max_abs_diff, random_tensor_uniform};
use sconv_f32::{get_num_threads, ActType, ConvParameter, KernelSelector};

/// Times one convolution path on random NHWC operands
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// number of repeats
    #[arg(short, long, default_value_t = 5)]
    n_repeats: usize,

    /// direct, conv1x1 or winograd
    #[arg(short, long, default_value_t = String::from("direct"))]
    path: String,

    /// batch dim
    #[arg(short, long, default_value_t = 1)]
    batch: usize,

    /// input height
    #[arg(long, default_value_t = 56)]
    height: usize,

    /// input width
    #[arg(long, default_value_t = 56)]
    width: usize,

    /// input channels
    #[arg(short, long, default_value_t = 64)]
    in_channel: usize,

    /// output channels
    #[arg(short, long, default_value_t = 64)]
    out_channel: usize,

    /// square kernel size
    #[arg(short, long, default_value_t = 3)]
    kernel: usize,

    #[arg(long, default_value_t = 1)]
    stride: usize,

    /// padding on every side
    #[arg(long, default_value_t = 1)]
    pad: usize,

    /// tasks per call, 0 reads SCONV_NUM_THREADS
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// fuse relu into the output
    #[arg(long, default_value_t = false)]
    relu: bool,

    /// compare against the naive convolution
    #[arg(short, long, default_value_t = false)]
    check: bool,

    /// print one json report instead of per run lines
    #[arg(short, long, default_value_t = false)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let path: BenchPath = match args.path.parse() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    let threads = if args.threads == 0 { get_num_threads() } else { args.threads };
    let act = if args.relu { ActType::Relu } else { ActType::Identity };
    let p = ConvParameter::new(
        args.batch,
        args.height,
        args.width,
        args.in_channel,
        args.out_channel,
        args.kernel,
        args.kernel,
    )
    .with_stride(args.stride, args.stride)
    .with_pad(args.pad, args.pad, args.pad, args.pad)
    .with_threads(threads)
    .with_act(act);

    let mut input = vec![0f32; p.input_size()];
    let mut weight = vec![0f32; p.weight_size()];
    let mut bias = vec![0f32; p.output_channel];
    random_tensor_uniform(&mut input);
    random_tensor_uniform(&mut weight);
    random_tensor_uniform(&mut bias);

    let bench = match ConvBench::new(path, p, KernelSelector::detect(), &input, &weight, &bias) {
        Ok(bench) => bench,
        Err(e) => {
            eprintln!("cannot run {} on {:?}: {}", path, p, e);
            std::process::exit(1);
        }
    };

    let mut output = vec![0f32; p.output_size()];
    let mut times = Vec::with_capacity(args.n_repeats);
    let mut total_time = 0.0;
    for _ in 0..args.n_repeats {
        let start_time = std::time::Instant::now();
        if let Err(e) = bench.run(&mut output) {
            eprintln!("{} failed: {}", path, e);
            std::process::exit(1);
        }
        let end_time = start_time.elapsed().as_nanos() as f64 / 1e9;
        total_time += end_time;
        if !args.json {
            println!("time: {}, total_time: {}", end_time, total_time);
        }
        times.push(end_time);
    }

    let diff = if args.check {
        let want = reference_output(&p, &input, &weight, &bias);
        Some(max_abs_diff(&output, &want))
    } else {
        None
    };

    let report = BenchReport::new(&bench, times, diff);
    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("cannot serialize report: {}", e),
        }
        return;
    }
    if let Some(diff) = report.diff {
        println!("diff: {}", diff);
    }
    println!("kernel: {}, best_time: {}, GFLOPS: {}", report.kernel, report.best_time, report.gflops);
}
