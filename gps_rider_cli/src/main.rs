use anyhow::{Context, Result};
use argh::FromArgs;
use rand::rngs::StdRng;
use rand::SeedableRng;

use gps_rider::prefs::{
    decode_double, encode_double, ConfigurationSource, Override, PreferenceSnapshot,
};
use gps_rider::shared_prefs::{SharedPrefsFile, DEFAULT_PREFS_PATH};
use gps_rider::synth::{equirectangular_distance_m, synthesize};

/// GPS Rider preference inspection tool
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    /// Print the decoded spoofing preferences
    Show(ShowArgs),
    /// Synthesize fake locations from a preference file
    Sample(SampleArgs),
    /// Print the long bit pattern a double is stored as
    EncodeDouble(EncodeDoubleArgs),
    /// Print the double a stored long bit pattern holds
    DecodeLong(DecodeLongArgs),
}

/// Print the decoded spoofing preferences
#[derive(FromArgs)]
#[argh(subcommand, name = "show")]
struct ShowArgs {
    /// shared preferences XML file
    #[argh(option, short = 'p', long = "prefs", default = "DEFAULT_PREFS_PATH.to_string()")]
    prefs: String,
}

/// Synthesize fake locations from a preference file
#[derive(FromArgs)]
#[argh(subcommand, name = "sample")]
struct SampleArgs {
    /// shared preferences XML file
    #[argh(option, short = 'p', long = "prefs", default = "DEFAULT_PREFS_PATH.to_string()")]
    prefs: String,

    /// number of locations to draw
    #[argh(option, short = 'n', long = "count", default = "5")]
    count: usize,

    /// seed for reproducible draws
    #[argh(option, long = "seed")]
    seed: Option<u64>,
}

/// Print the long bit pattern a double is stored as
#[derive(FromArgs)]
#[argh(subcommand, name = "encode-double")]
struct EncodeDoubleArgs {
    /// value to encode
    #[argh(positional)]
    value: f64,
}

/// Print the double a stored long bit pattern holds
#[derive(FromArgs)]
#[argh(subcommand, name = "decode-long")]
struct DecodeLongArgs {
    /// raw bits as stored in the XML file
    #[argh(positional)]
    bits: i64,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Command::Show(args) => {
            let snapshot = load_snapshot(&args.prefs)?;
            print_snapshot(&snapshot);
        }
        Command::Sample(args) => {
            let snapshot = load_snapshot(&args.prefs)?;
            let mut rng = match args.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let base = snapshot.base_coordinate();
            for _ in 0..args.count {
                let fake = synthesize(base, &snapshot, &mut rng)?;
                println!(
                    "{:.7}, {:.7}  ({:.1} m)",
                    fake.coordinate.latitude,
                    fake.coordinate.longitude,
                    equirectangular_distance_m(base, fake.coordinate)
                );
            }
        }
        Command::EncodeDouble(args) => println!("{}", encode_double(args.value)),
        Command::DecodeLong(args) => println!("{}", decode_double(args.bits)),
    }

    Ok(())
}

fn load_snapshot(path: &str) -> Result<PreferenceSnapshot> {
    let map = SharedPrefsFile::new(path)
        .load()
        .with_context(|| format!("reading {}", path))?;
    Ok(PreferenceSnapshot::from_map(&map)?)
}

fn show_override<T: std::fmt::Display>(name: &str, value: &Override<T>) {
    let state = if value.enabled { "on" } else { "off" };
    println!("{:<24}{} ({})", name, value.value, state);
}

fn print_snapshot(snapshot: &PreferenceSnapshot) {
    println!("{:<24}{}", "playing", snapshot.is_playing);
    match snapshot.base {
        Some(base) => println!("{:<24}{}, {}", "base", base.latitude, base.longitude),
        None => println!("{:<24}not picked (0, 0)", "base"),
    }
    show_override("accuracy", &snapshot.accuracy);
    show_override("altitude", &snapshot.altitude);
    show_override("vertical_accuracy", &snapshot.vertical_accuracy);
    show_override("speed", &snapshot.speed);
    show_override("speed_accuracy", &snapshot.speed_accuracy);
    show_override("mean_sea_level", &snapshot.mean_sea_level);
    show_override("mean_sea_level_accuracy", &snapshot.mean_sea_level_accuracy);
    show_override("randomize_radius", &snapshot.randomize);
    println!("{:<24}{}", "system_hook", snapshot.use_system_hook);
}
