//! Build script rendering the `testbed` man pages.
//!
//! `testbed.1` documents the top-level command and `testbed-deploy.1` the
//! deploy subcommand with its target source and binary override flags. Both
//! land in the build output directory for packaging.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    write_page(&out_dir, "testbed.1", &Man::new(command.clone()))?;
    for sub in command.get_subcommands() {
        let title = format!("testbed-{}", sub.get_name());
        let page = Man::new(sub.clone()).title(title.to_uppercase());
        write_page(&out_dir, &format!("{title}.1"), &page)?;
    }

    Ok(())
}

fn write_page(out_dir: &Path, file_name: &str, page: &Man) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    page.render(&mut buffer)?;
    File::create(out_dir.join(file_name))?.write_all(&buffer)
}
