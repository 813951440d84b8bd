//! Dump an ESP-IDF NVS partition image.
//!
//! ```bash
//! cargo run --bin nvs_dump -- nvs.bin
//! cargo run --features json --bin nvs_dump -- --json nvs.bin
//! ```
//!
//! Entries with a bad CRC are listed as skipped; the dump itself only fails
//! when the image is not a whole number of pages.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use rs_throttle_bridge::nvs;

#[derive(Debug, Parser)]
#[command(name = "nvs_dump", about = "Dump an ESP-IDF NVS partition image")]
struct Args {
    /// Print the dump as JSON (needs the `json` feature)
    #[arg(long)]
    json: bool,

    /// Partition image to read
    image: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = args.image.display();

    let image = fs::read(&args.image).with_context(|| format!("reading {}", path))?;
    let dump = nvs::dump(&image).with_context(|| format!("decoding {}", path))?;

    if args.json {
        print_json(&dump)?;
    } else {
        print!("{}", dump);
    }
    Ok(())
}

#[cfg(feature = "json")]
fn print_json(dump: &nvs::NvsDump) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(dump)?);
    Ok(())
}

#[cfg(not(feature = "json"))]
fn print_json(_dump: &nvs::NvsDump) -> anyhow::Result<()> {
    anyhow::bail!("built without the `json` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_required() {
        assert!(Args::try_parse_from(["nvs_dump", "--json"]).is_err());
    }

    #[test]
    fn json_flag_and_image() {
        let args = Args::try_parse_from(["nvs_dump", "--json", "nvs.bin"]).unwrap();
        assert!(args.json);
        assert_eq!(args.image, PathBuf::from("nvs.bin"));

        let args = Args::try_parse_from(["nvs_dump", "nvs.bin"]).unwrap();
        assert!(!args.json);
    }

    #[test]
    fn extra_positional_is_rejected() {
        assert!(Args::try_parse_from(["nvs_dump", "a.bin", "b.bin"]).is_err());
    }
}
