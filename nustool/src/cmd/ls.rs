use std::{
    fs,
    path::{Path, PathBuf},
};

use argp::FromArgs;
use nus::{Fst, Layout, Package, ResultContext};

use crate::util::{display, format_size, load_keys};

#[derive(FromArgs, Debug)]
/// Lists the files of a title.
#[argp(subcommand, name = "ls")]
pub struct Args {
    #[argp(positional)]
    /// Path to title directory
    dir: PathBuf,
    #[argp(positional)]
    /// Directory to list (default: /)
    path: Option<String>,
    #[argp(option, short = 'k')]
    /// Path to keys.conf (env: NUS_KEYS)
    keys: Option<PathBuf>,
}

pub fn run(args: Args) -> nus::Result<()> {
    let keys = load_keys(args.keys.as_deref())?;
    let package = Package::new(&args.dir, &keys)?;
    let path = args.path.as_deref().unwrap_or("/");
    match package.layout() {
        Layout::Nus => {
            let Some(fst) = package.fst() else {
                return Err(nus::Error::Other(format!(
                    "Cannot list files: {}",
                    package.status()
                )));
            };
            let entry = fst.find_file(path)?;
            if entry.is_dir() {
                list_fst(fst, path)
            } else {
                print_file(entry.size, Some(entry.content_index), path);
                Ok(())
            }
        }
        Layout::Extracted => {
            let relative = path.trim_start_matches('/');
            list_extracted(&args.dir.join(relative), relative)
        }
    }
}

fn print_file(size: u64, content_index: Option<u16>, path: &str) {
    let content = content_index.map(|idx| idx.to_string()).unwrap_or_else(|| "-".to_string());
    println!("{:>12} {:>4}  {}", format_size(size), content, path);
}

fn list_fst(fst: &Fst, path: &str) -> nus::Result<()> {
    for entry in fst.read_dir(path)? {
        let entry = entry?;
        let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
        if entry.is_dir() {
            println!("{:>12} {:>4}  {}/", "", "", child);
            list_fst(fst, &child)?;
        } else {
            print_file(entry.size, Some(entry.content_index), &child);
        }
    }
    Ok(())
}

fn list_extracted(dir: &Path, prefix: &str) -> nus::Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Reading directory {}", display(dir)))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Reading directory {}", display(dir)))?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let child = format!("{}/{}", prefix.trim_end_matches('/'), name.to_string_lossy());
        let metadata = entry
            .metadata()
            .with_context(|| format!("Reading metadata for {}", display(&entry.path())))?;
        if metadata.is_dir() {
            println!("{:>12} {:>4}  {}/", "", "", child);
            list_extracted(&entry.path(), &child)?;
        } else {
            print_file(metadata.len(), None, &child);
        }
    }
    Ok(())
}
