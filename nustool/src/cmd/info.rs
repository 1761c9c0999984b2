use std::path::{Path, PathBuf};

use argp::FromArgs;
use nus::{KeyStore, Package, TicketFormat, TmdFormat};

use crate::util::{
    display, format_size, load_keys,
    meta::{self, META_PATH},
};

#[derive(FromArgs, Debug)]
/// Displays information about titles.
#[argp(subcommand, name = "info")]
pub struct Args {
    #[argp(positional)]
    /// Path to title directories
    dir: Vec<PathBuf>,
    #[argp(option, short = 'k')]
    /// Path to keys.conf (env: NUS_KEYS)
    keys: Option<PathBuf>,
}

pub fn run(args: Args) -> nus::Result<()> {
    let keys = load_keys(args.keys.as_deref())?;
    for dir in &args.dir {
        info_dir(dir, &keys)?;
    }
    Ok(())
}

fn info_dir(path: &Path, keys: &KeyStore) -> nus::Result<()> {
    log::info!("Loading {}", display(path));
    let mut package = Package::new(path, keys)?;
    println!("Layout: {}", package.layout());
    println!("Status: {}", package.status());

    if let Some(ticket) = package.ticket() {
        println!();
        println!("Ticket");
        println!("\tFormat version: {}", ticket.format_version());
        println!("\tTitle ID: {}", ticket.title_id());
        println!("\tIssuer: {}", ticket.issuer().unwrap_or("N/A"));
        match ticket.common_key() {
            Ok(key) => println!("\tCommon key: {}", key),
            Err(e) => println!("\tCommon key: {}", e),
        }
        if let TicketFormat::V1 { sections, .. } = ticket.format() {
            println!("\tSections: {}", sections.len());
        }
    }

    if let Some(tmd) = package.tmd() {
        println!();
        println!("TMD");
        println!("\tFormat version: {}", tmd.format_version());
        println!("\tTitle ID: {}", tmd.title_id());
        println!("\tTitle version: {}", tmd.title_version());
        println!("\tBoot index: {}", tmd.boot_index());
        println!("\tIssuer: {}", tmd.issuer().unwrap_or("N/A"));
        if let TmdFormat::V0 { contents } = tmd.format() {
            println!("\tContents: {} (vWii)", contents.len());
        }
    }

    if !package.contents().is_empty() {
        println!();
        println!("Contents");
        for (idx, content) in package.contents().iter().enumerate() {
            let mut flags = Vec::new();
            if content.is_encrypted() {
                flags.push("encrypted");
            }
            if content.is_hashed() {
                flags.push("hashed");
            }
            println!(
                "\t{}: {:08x}.app, index {}, size {:#X} ({}) [{}]",
                idx,
                content.content_id,
                content.index,
                content.size,
                format_size(content.size),
                flags.join(", ")
            );
        }
    }

    if let Some(fst) = package.fst() {
        println!();
        println!("File system");
        println!("\tNodes: {}", fst.node_count());
        println!("\tFiles: {}", fst.iter().filter(|(_, node, _)| node.is_file()).count());
        println!("\tTotal size: {}", format_size(fst.total_used_size()));
    }

    match package.read_file(META_PATH) {
        Ok(data) => match meta::parse(&data) {
            Ok(meta) => {
                println!();
                println!("Metadata");
                let fields = [
                    ("Product code", &meta.product_code),
                    ("Name", &meta.longname_en),
                    ("Publisher", &meta.publisher_en),
                ];
                for (label, value) in fields {
                    if let Some(value) = value.get() {
                        println!("\t{}: {}", label, value);
                    }
                }
            }
            Err(e) => log::warn!("Failed to parse {}: {}", META_PATH, e),
        },
        Err(e) => log::debug!("Failed to read {}: {}", META_PATH, e),
    }
    println!();
    Ok(())
}
