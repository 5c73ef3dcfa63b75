//! kiln command-line driver.
//!
//! `kiln link` links rpkg files into an executable; `kiln rpkg` prints
//! debug information about an rpkg file; `kiln stdlib` bundles rpkg files
//! into an rstd standard library.

use clap::{Args, Parser, Subcommand};
use kiln::link::{self, LinkConfig};
use kiln::rpkg::{self, DumpOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Link compiled rpkg packages into executables")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "warn", value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Link a main package and its dependencies into an ELF executable
    Link(LinkArgs),

    /// Print debug information about an rpkg file
    Rpkg(RpkgArgs),

    /// Bundle rpkg files into an rstd standard library
    Stdlib(StdlibArgs),
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Output executable
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Address of the first section
    #[arg(long, default_value = "0x200000", value_parser = parse_address)]
    base_address: u64,

    /// Fully-qualified entry function (default: main in the main package)
    #[arg(long)]
    entry: Option<String>,

    /// Include a symbol table
    #[arg(long)]
    symbol_table: bool,

    /// Record every linked package and its checksum in an rpkgs section
    #[arg(long)]
    provenance: bool,

    /// Standard library bundle; every package in it is linked
    #[arg(long)]
    stdlib: Option<PathBuf>,

    /// The main package
    main: PathBuf,

    /// Dependency packages
    deps: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct StdlibArgs {
    /// Output rstd file
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// The rpkg files to bundle
    #[arg(required = true)]
    rpkgs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RpkgArgs {
    /// Print the file header
    #[arg(long)]
    header: bool,

    /// Print imported package names
    #[arg(long)]
    imports: bool,

    /// Print exported symbols
    #[arg(long)]
    exports: bool,

    /// Print the types defined
    #[arg(long)]
    types: bool,

    /// Print the symbols defined
    #[arg(long)]
    symbols: bool,

    /// Print the strings defined
    #[arg(long)]
    strings: bool,

    /// Print the linkages defined
    #[arg(long)]
    linkages: bool,

    /// Print each function's links and code
    #[arg(long)]
    functions: bool,

    /// Print everything
    #[arg(long)]
    all: bool,

    /// The rpkg file
    file: PathBuf,
}

impl RpkgArgs {
    fn options(&self) -> DumpOptions {
        if self.all {
            return DumpOptions::all();
        }
        let opts = DumpOptions {
            header: self.header,
            imports: self.imports,
            exports: self.exports,
            types: self.types,
            symbols: self.symbols,
            strings: self.strings,
            linkages: self.linkages,
            functions: self.functions,
        };
        // With nothing selected, print the header.
        if opts == DumpOptions::default() {
            DumpOptions { header: true, ..opts }
        } else {
            opts
        }
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn run_link(args: LinkArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = LinkConfig::default()
        .with_base_address(args.base_address)
        .with_symbol_table(args.symbol_table)
        .with_provenance(args.provenance);
    if let Some(entry) = args.entry {
        config = config.with_entry(entry);
    }
    if let Some(stdlib) = args.stdlib {
        config = config.with_stdlib(stdlib);
    }

    let image = link::link_files(&args.main, &args.deps, &config)?;
    write_executable(&args.output, &image)?;
    log::info!("wrote {} ({} bytes)", args.output.display(), image.len());
    Ok(())
}

/// Replaces `path` with an executable holding `data`. The data is written
/// to a temporary file beside `path` and renamed into place, so `path` is
/// never left half-written.
fn write_executable(path: &Path, data: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{} is not a file name", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name.to_string_lossy(), std::process::id()));
    let result = write_and_rename(&tmp, path, data);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn write_and_rename(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).create_new(true).open(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::rename(tmp, path)
}

fn run_stdlib(args: StdlibArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut rpkgs = Vec::with_capacity(args.rpkgs.len());
    for path in &args.rpkgs {
        rpkgs.push(std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?);
    }
    let arch = rpkg::Decoder::new(&rpkgs[0])
        .map_err(|e| format!("failed to parse {}: {}", args.rpkgs[0].display(), e))?
        .arch();
    let bundle = rpkg::encode_stdlib(&arch, &rpkgs)?;
    std::fs::write(&args.output, &bundle).map_err(|e| format!("failed to write {}: {}", args.output.display(), e))?;
    log::info!("wrote {} packages to {} ({} bytes)", rpkgs.len(), args.output.display(), bundle.len());
    Ok(())
}

fn run_rpkg(args: RpkgArgs) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(&args.file).map_err(|e| format!("failed to read {}: {}", args.file.display(), e))?;
    let decoder =
        rpkg::Decoder::new(&data).map_err(|e| format!("failed to parse {}: {}", args.file.display(), e))?;
    print!("{}", rpkg::dump(&decoder, &args.options()));
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Commands::Link(args) => run_link(args),
        Commands::Rpkg(args) => run_rpkg(args),
        Commands::Stdlib(args) => run_stdlib(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
