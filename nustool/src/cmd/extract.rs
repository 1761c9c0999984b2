use std::{
    borrow::Cow,
    fs,
    fs::File,
    io,
    io::Write,
    path::{Path, PathBuf},
};

use argp::FromArgs;
use itertools::Itertools;
use nus::{Layout, OpenOptions, Package, ResultContext};

use crate::util::{display, format_size, load_keys};

#[derive(FromArgs, Debug)]
/// Extracts the files of a NUS package.
#[argp(subcommand, name = "extract")]
pub struct Args {
    #[argp(positional)]
    /// Path to title directory
    dir: PathBuf,
    #[argp(positional)]
    /// Output directory (default: <dir>/extracted)
    out: Option<PathBuf>,
    #[argp(switch, short = 'q')]
    /// Quiet output
    quiet: bool,
    #[argp(switch, short = 'h')]
    /// Validate sector hashes
    validate: bool,
    #[argp(option, short = 'k')]
    /// Path to keys.conf (env: NUS_KEYS)
    keys: Option<PathBuf>,
}

pub fn run(args: Args) -> nus::Result<()> {
    let output_dir = args.out.unwrap_or_else(|| args.dir.join("extracted"));
    let keys = load_keys(args.keys.as_deref())?;
    let mut package = Package::new_with_options(&args.dir, &keys, &OpenOptions {
        validate_hashes: args.validate,
    })?;
    if package.layout() == Layout::Extracted {
        return Err(nus::Error::InvalidArgument(format!(
            "{} is already extracted",
            display(&args.dir)
        )));
    }
    let Some(fst) = package.fst().cloned() else {
        return Err(nus::Error::Other(format!("Cannot extract: {}", package.status())));
    };
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Creating directory {}", display(&output_dir)))?;

    let mut path_segments = Vec::<(Cow<str>, usize)>::new();
    for (idx, node, name) in fst.iter() {
        // Remove ended path segments
        let mut new_size = 0;
        for (_, end) in path_segments.iter() {
            if *end == idx {
                break;
            }
            new_size += 1;
        }
        path_segments.truncate(new_size);

        // Add the new path segment
        let name = name?;
        if name == "." || name == ".." {
            let message = format!("Invalid file name {:?} at node {}", name, idx);
            return Err(nus::Error::Format(message));
        }
        let end = if node.is_dir() { node.length() as usize } else { idx + 1 };
        path_segments.push((name, end));

        let path = path_segments.iter().map(|(name, _)| name.as_ref()).join("/");
        if node.is_dir() {
            fs::create_dir_all(output_dir.join(&path))
                .with_context(|| format!("Creating directory {}", path))?;
        } else {
            extract_file(&mut package, &output_dir, &path, node.length(), args.quiet)?;
        }
    }
    Ok(())
}

fn extract_file(
    package: &mut Package,
    base_path: &Path,
    path: &str,
    size: u64,
    quiet: bool,
) -> nus::Result<()> {
    let file_path = base_path.join(path);
    if !quiet {
        println!("Extracting {} (size: {})", display(&file_path), format_size(size));
    }
    let mut file = File::create(&file_path)
        .with_context(|| format!("Creating file {}", display(&file_path)))?;
    let mut r = package.open(&format!("/{}", path))?;
    io::copy(&mut r, &mut file)
        .with_context(|| format!("Extracting file {}", display(&file_path)))?;
    file.flush().with_context(|| format!("Flushing file {}", display(&file_path)))?;
    Ok(())
}
