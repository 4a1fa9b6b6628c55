use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process,
};

use argparse::{ArgumentParser, Print, StoreOption, StoreTrue};

// What the process was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // One-shot queries, print and exit
    List,
    Status,
    Diagnose,
    Curves,
    ExportPresets,
    Reset,

    // Keep controlling the fans until interrupted
    Run {
        duty: Option<i32>,
        curve: Option<String>,
        dbus: bool,
    },

    // Restore the last profile if configured, show the status otherwise
    Default,
}

#[derive(Debug, Default)]
pub struct ArgsOptions {
    pub config_file_path: Option<PathBuf>,
    pub presets_dir: Option<PathBuf>,
    pub unit: Option<usize>,

    pub list: bool,
    pub status: bool,
    pub diagnose: bool,
    pub curves: bool,
    pub export_presets: bool,
    pub reset: bool,

    pub duty: Option<i32>,
    pub curve: Option<String>,
    pub dbus: bool,

    pub verbose: bool,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let args = env::args().collect();

        Self::parse_from(args, &mut io::stdout(), &mut io::stderr())
            .unwrap_or_else(|code| process::exit(code))
    }

    // Parse the given arguments, the first one being the program name.
    // Returns the exit code on --help, --version or bad usage
    pub fn parse_from(
        args: Vec<String>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<Self, i32> {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("GPU fan controller");

            // Storage locations
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                StoreOption,
                "The file path of the configuration file",
            );
            parser.refer(&mut options.presets_dir).add_option(
                &["--presets"],
                StoreOption,
                "The directory holding the saved fan curves",
            );
            parser.refer(&mut options.unit).add_option(
                &["-u", "--unit"],
                StoreOption,
                "Index of the GPU to control (default: last selected)",
            );

            // Queries
            parser.refer(&mut options.list).add_option(
                &["--list"],
                StoreTrue,
                "List the detected GPUs",
            );
            parser.refer(&mut options.status).add_option(
                &["--status"],
                StoreTrue,
                "Show temperature and fan speed of every GPU",
            );
            parser.refer(&mut options.diagnose).add_option(
                &["--diagnose"],
                StoreTrue,
                "Show sensor and fan control diagnostics",
            );
            parser.refer(&mut options.curves).add_option(
                &["--curves"],
                StoreTrue,
                "List the built-in and saved fan curves",
            );
            parser.refer(&mut options.export_presets).add_option(
                &["--export-presets"],
                StoreTrue,
                "Save the built-in fan curves to the presets directory",
            );
            parser.refer(&mut options.reset).add_option(
                &["--reset"],
                StoreTrue,
                "Give every fan back to automatic control",
            );

            // Control
            parser.refer(&mut options.duty).add_option(
                &["--duty"],
                StoreOption,
                "Set a fixed fan duty in percent",
            );
            parser.refer(&mut options.curve).add_option(
                &["--curve"],
                StoreOption,
                "Follow the named fan curve",
            );
            parser.refer(&mut options.dbus).add_option(
                &["--dbus"],
                StoreTrue,
                "Expose the GPUs on the session D-Bus",
            );

            parser.refer(&mut options.verbose).add_option(
                &["-v", "--verbose"],
                StoreTrue,
                "Enable debug logging",
            );

            // Show version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the program version",
            );

            parser.parse(args, stdout, stderr)?;
        }

        Ok(options)
    }

    pub fn command(&self) -> Command {
        if self.list {
            Command::List
        } else if self.status {
            Command::Status
        } else if self.diagnose {
            Command::Diagnose
        } else if self.curves {
            Command::Curves
        } else if self.export_presets {
            Command::ExportPresets
        } else if self.reset {
            Command::Reset
        } else if self.duty.is_some() || self.curve.is_some() || self.dbus {
            Command::Run {
                duty: self.duty,
                curve: self.curve.clone(),
                dbus: self.dbus,
            }
        } else {
            Command::Default
        }
    }
}
