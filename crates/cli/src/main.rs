// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Kairos debug CLI
//!
//! Operator tooling for inspecting persisted artifacts. `decode-task` reads
//! a serialized task blob and prints a human-readable rendering.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kairos_core::TaskCategory;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kairos-tdbg")]
#[command(about = "Kairos debug tool - decode persisted artifacts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a serialized task blob and print it
    DecodeTask {
        /// Numeric task category id (see `kairos-tdbg categories`)
        #[arg(long)]
        task_category_id: i32,

        /// Blob encoding (currently ENCODING_TYPE_JSON)
        #[arg(long, default_value = "ENCODING_TYPE_JSON")]
        encoding: String,

        /// Path to the binary blob file
        #[arg(long)]
        binary_file: PathBuf,
    },

    /// List known task categories and their ids
    Categories,
}

fn decode_task(task_category_id: i32, encoding: &str, binary_file: &PathBuf) -> Result<()> {
    let Some(category) = TaskCategory::from_id(task_category_id) else {
        bail!("unknown task category id {}", task_category_id);
    };
    if encoding != "ENCODING_TYPE_JSON" {
        bail!("unsupported encoding {}", encoding);
    }

    let blob = std::fs::read(binary_file)
        .with_context(|| format!("reading {}", binary_file.display()))?;
    let payload: serde_json::Value =
        serde_json::from_slice(&blob).context("decoding task blob as JSON")?;

    println!("category: {} (id {})", category, category.id());
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn list_categories() {
    for category in kairos_core::TaskCategoryRegistry::new_default().categories() {
        println!("{:2}  {:12} {:?}", category.id(), category.name(), category.kind());
    }
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::DecodeTask {
            task_category_id,
            encoding,
            binary_file,
        } => decode_task(*task_category_id, encoding, binary_file),
        Commands::Categories => {
            list_categories();
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("kairos-tdbg: {:#}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_decode_task_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"kind":"workflow_task","shard_id":3}"#)
            .unwrap();
        decode_task(1, "ENCODING_TYPE_JSON", &file.path().to_path_buf()).unwrap();
    }

    #[test]
    fn test_decode_task_rejects_unknown_category() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{}").unwrap();
        let err = decode_task(99, "ENCODING_TYPE_JSON", &file.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("unknown task category id 99"));
    }

    #[test]
    fn test_decode_task_rejects_unknown_encoding() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{}").unwrap();
        let err = decode_task(1, "ENCODING_TYPE_PROTO3", &file.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("unsupported encoding"));
    }

    #[test]
    fn test_decode_task_propagates_io_failure() {
        let missing = PathBuf::from("/definitely/not/here.blob");
        assert!(decode_task(1, "ENCODING_TYPE_JSON", &missing).is_err());
    }
}
