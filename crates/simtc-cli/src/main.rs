use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::{Context, IntoDiagnostic};

use simtc_backend_core::{BackendOptions, BackendRegistry};
use simtc_ir::{
    AddressSpace, Builder, CoreConfig, CoreFeatureFlags, CorePreset, DYNAMIC, Function, Handle,
    Program, ScalarType, Transpose, Value,
};
use simtc_opt::{OptLevel, PassManager, PassOptions};

/// simtc: tensor kernel compiler for SIMT accelerators
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Core preset: pvc, tgl or generic
    #[arg(long, global = true, default_value = "pvc")]
    core: CorePreset,

    /// Request the large register file
    #[arg(long, global = true)]
    large_grf: bool,

    /// Restrict the core to one subgroup size
    #[arg(long, global = true)]
    subgroup_size: Option<u32>,

    /// Target backend
    #[arg(short, long, global = true, default_value = "opencl")]
    target: String,

    /// Optimization level: 0, 1, or 2
    #[arg(long, global = true, default_value = "1")]
    opt_level: OptLevel,

    /// Allow floating-point folds that are not exact
    #[arg(long, global = true)]
    unsafe_fp_math: bool,

    /// Dump IR to stderr after the pass pipeline
    #[arg(long, global = true)]
    emit_ir: bool,

    /// Output path (default: stdout)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a single GEMM kernel: C = alpha * op(A) * op(B) + beta * C
    Gemm(GemmArgs),
    /// Print the configuration of the selected core
    CoreInfo,
}

#[derive(Args)]
struct GemmArgs {
    #[arg(short = 'M', default_value_t = 64)]
    m: i64,
    #[arg(short = 'N', default_value_t = 64)]
    n: i64,
    #[arg(short = 'K', default_value_t = 64)]
    k: i64,

    /// Scalar type of all operands
    #[arg(long, default_value = "f32")]
    ty: ScalarType,

    #[arg(long)]
    trans_a: bool,
    #[arg(long)]
    trans_b: bool,

    /// Update C atomically
    #[arg(long)]
    atomic: bool,

    #[arg(long, default_value_t = 1.0)]
    alpha: f64,
    #[arg(long, default_value_t = 0.0)]
    beta: f64,

    /// Pass M, N and K at launch instead of fixing them in the kernel
    #[arg(long)]
    dynamic: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

fn core_config(cli: &Cli) -> miette::Result<CoreConfig> {
    let mut core = CoreConfig::preset(cli.core);
    if cli.large_grf {
        core = core.with_features(CoreFeatureFlags::LARGE_REGISTER_FILE);
    }
    if let Some(size) = cli.subgroup_size {
        core = core
            .subgroup(size)
            .into_diagnostic()
            .wrap_err_with(|| format!("core `{}`", cli.core))?;
    }
    Ok(core)
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let core = core_config(&cli)?;

    let program = match &cli.command {
        Command::CoreInfo => {
            let text = core_info(cli.core, &core);
            return write_output(cli.output.as_deref(), &text);
        }
        Command::Gemm(args) => gemm_program(args)
            .into_diagnostic()
            .wrap_err("failed to build GEMM program")?,
    };

    let opts = BackendOptions {
        core,
        passes: PassOptions {
            opt_level: cli.opt_level,
            unsafe_fp_math: cli.unsafe_fp_math,
        },
    };
    log::debug!("{opts}");

    if cli.emit_ir {
        let mut lowered = program.clone();
        PassManager::for_options(&opts.core, &opts.passes)
            .run(&mut lowered)
            .into_diagnostic()
            .wrap_err("pass pipeline failed")?;
        eprintln!("{}", simtc_ir::dump_program(&lowered));
    }

    let mut registry = BackendRegistry::with_builtins();
    registry.register(Box::new(simtc_backend_opencl::OpenClBackend));
    let backend = registry.resolve(&cli.target).into_diagnostic()?;

    let output = backend
        .compile(&program, &opts)
        .into_diagnostic()
        .wrap_err_with(|| format!("{} compilation failed", backend.name()))?;

    for diag in &output.diagnostics {
        eprintln!("{diag}");
    }
    for file in &output.files {
        log::debug!("writing {} ({:?})", file.name, file.kind);
        write_output(cli.output.as_deref(), &file.text)?;
    }
    Ok(())
}

/// Writes `text` to `path`, or to stdout without one.
fn write_output(path: Option<&Path>, text: &str) -> miette::Result<()> {
    match path {
        Some(path) => std::fs::write(path, text)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display())),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

fn core_info(preset: CorePreset, core: &CoreConfig) -> String {
    format!(
        "core: {preset}\n\
         subgroup sizes: {:?}\n\
         register space: {} B\n\
         max work-group size: {}\n\
         local memory: {} B\n",
        core.subgroup_sizes,
        core.effective_register_space(),
        core.max_work_group_size,
        core.local_memory_size,
    )
}

/// Builds a program with one kernel `gemm` computing `C = alpha * op(A) * op(B) + beta * C`.
fn gemm_program(args: &GemmArgs) -> simtc_ir::Result<Program> {
    let extent = |v: i64| if args.dynamic { DYNAMIC } else { v };
    let (m, n, k) = (extent(args.m), extent(args.n), extent(args.k));
    let a_shape = match args.trans_a {
        false => [m, k],
        true => [k, m],
    };
    let b_shape = match args.trans_b {
        false => [k, n],
        true => [n, k],
    };
    let trans = |t: bool| if t { Transpose::T } else { Transpose::N };

    let mut program = Program::new();
    let types = &mut program.types;
    let at = types.memref(args.ty, &a_shape, &[], AddressSpace::Global, None)?;
    let bt = types.memref(args.ty, &b_shape, &[], AddressSpace::Global, None)?;
    let ct = types.memref(args.ty, &[m, n], &[], AddressSpace::Global, None)?;

    let mut func = Function::new("gemm");
    let a = func.add_param(at, "A");
    let b = func.add_param(bt, "B");
    let c = func.add_param(ct, "C");
    Builder::build_body(&mut program.types, &mut func, |bb| {
        let alpha = scalar_constant(bb, args.alpha, args.ty)?;
        let beta = scalar_constant(bb, args.beta, args.ty)?;
        bb.gemm(
            trans(args.trans_a),
            trans(args.trans_b),
            args.atomic,
            alpha,
            a,
            b,
            beta,
            c,
        )?;
        Ok(())
    })?;
    program.add_function(func)?;
    Ok(program)
}

fn scalar_constant(bb: &mut Builder<'_>, value: f64, ty: ScalarType) -> simtc_ir::Result<Handle<Value>> {
    if ty.is_integer() {
        bb.constant_int(value as i64, ty)
    } else {
        bb.constant_float(value, ty)
    }
}
