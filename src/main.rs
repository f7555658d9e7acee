// src/main.rs
//! TTA resource manager CLI
//! Validates machine descriptions and schedules program listings

use clap::{Arg, ArgMatches, Command};
use serde::Serialize;

use tta_resman::config::MachineConfig;
use tta_resman::manager::{CycleBound, SimpleResourceManager};
use tta_resman::tta::ProgramListing;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match matches.subcommand() {
        Some(("validate", sub_matches)) => {
            cmd_validate(sub_matches)?;
        }
        Some(("config-gen", sub_matches)) => {
            cmd_config_gen(sub_matches)?;
        }
        Some(("inspect", sub_matches)) => {
            cmd_inspect(sub_matches)?;
        }
        Some(("schedule", sub_matches)) => {
            cmd_schedule(sub_matches)?;
        }
        _ => {
            println!("TTA resource manager v0.1");
            println!("Use --help for available commands");
        }
    }

    Ok(())
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("Machine description")
        .required(true)
}

fn cli() -> Command {
    Command::new("tta-resman")
        .version("0.1.0")
        .about("Resource manager for transport-triggered instruction scheduling")
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .help("Debug logging")
            .global(true)
            .action(clap::ArgAction::SetTrue))
        .subcommand(
            Command::new("validate")
                .about("Validate a machine description and build its resource graph")
                .arg(config_arg())
        )
        .subcommand(
            Command::new("config-gen")
                .about("Generate the default test machine description")
                .arg(Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("FILE")
                    .help("Output file path")
                    .default_value("config/machine.toml"))
        )
        .subcommand(
            Command::new("inspect")
                .about("Print every broker and its resources")
                .arg(config_arg())
        )
        .subcommand(
            Command::new("schedule")
                .about("Place the moves of a program listing at their earliest cycles")
                .arg(config_arg())
                .arg(Arg::new("program")
                    .short('p')
                    .long("program")
                    .value_name("FILE")
                    .help("Program listing")
                    .required(true))
                .arg(Arg::new("json")
                    .long("json")
                    .help("Print the schedule as JSON")
                    .action(clap::ArgAction::SetTrue))
        )
}

fn load_manager(matches: &ArgMatches) -> Result<SimpleResourceManager, Box<dyn std::error::Error>> {
    let config_path = matches
        .get_one::<String>("config")
        .ok_or("missing --config")?;
    let config = MachineConfig::from_file(config_path)?;
    Ok(SimpleResourceManager::from_config(&config)?)
}

fn cmd_validate(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = matches
        .get_one::<String>("config")
        .ok_or("missing --config")?;

    println!("Validating machine description: {}", config_path);

    match load_manager(matches) {
        Ok(rm) => {
            let machine = rm.machine();
            println!("✓ Machine description is valid");
            println!("  Machine: {}", machine.name);
            println!("  Buses: {}", machine.buses.len());
            println!("  Function units: {}", machine.function_units.len());
            println!("  Instruction templates: {}", machine.templates.len());

            println!("\nResources:");
            for (kind, count) in rm.resource_counts() {
                println!("  {}: {}", kind, count);
            }
            println!("✓ Resource graph built ({} resources)", rm.resource_count());
        }
        Err(e) => {
            eprintln!("✗ Machine description failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn cmd_config_gen(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let output_path = matches
        .get_one::<String>("output")
        .ok_or("missing --output")?;

    if let Some(parent) = std::path::Path::new(output_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    MachineConfig::default_test().save_to_file(output_path)?;
    println!("✓ Default machine description written to {}", output_path);
    Ok(())
}

fn cmd_inspect(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let rm = load_manager(matches)?;
    print!("{}", rm);
    Ok(())
}

#[derive(Serialize)]
struct PlacedMove {
    node: usize,
    cycle: Option<i32>,
    text: String,
}

#[derive(Serialize)]
struct InstructionReport {
    cycle: i32,
    template: Option<String>,
    moves: Vec<String>,
    immediates: Vec<String>,
}

#[derive(Serialize)]
struct ScheduleReport {
    machine: String,
    length: i32,
    moves: Vec<PlacedMove>,
    instructions: Vec<InstructionReport>,
}

fn cmd_schedule(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let mut rm = load_manager(matches)?;
    let program_path = matches
        .get_one::<String>("program")
        .ok_or("missing --program")?;
    let json = matches.get_flag("json");

    let listing = ProgramListing::from_file(program_path)?;
    let (mut block, nodes) = listing.to_block(rm.machine())?;

    let mut failed = 0;
    for node in &nodes {
        match rm.earliest_cycle(&mut block, *node)? {
            CycleBound::Cycle(cycle) => rm.assign(&mut block, cycle, *node)?,
            bound => {
                failed += 1;
                log::warn!("{} cannot be placed: {}", node, bound);
            }
        }
    }

    let machine = rm.machine();
    let report = ScheduleReport {
        machine: machine.name.clone(),
        length: rm.largest_cycle() + 1,
        moves: nodes
            .iter()
            .map(|n| PlacedMove {
                node: n.0,
                cycle: block.node(*n).cycle,
                text: block.node(*n).transport.describe(machine),
            })
            .collect(),
        instructions: rm
            .instructions()
            .into_iter()
            .map(|(cycle, instruction)| InstructionReport {
                cycle,
                template: instruction.template.map(|t| machine.template(t).name.clone()),
                moves: instruction
                    .moves
                    .iter()
                    .map(|n| block.node(*n).transport.describe(machine))
                    .collect(),
                immediates: instruction
                    .immediates
                    .iter()
                    .map(|imm| {
                        format!(
                            "{}.{}=#{}",
                            machine.immediate_unit(imm.destination).name,
                            imm.register,
                            imm.value.value
                        )
                    })
                    .collect(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Schedule for {} ({} cycles)", report.machine, report.length);
        for (cycle, instruction) in rm.instructions() {
            println!("  {:>4}: {}", cycle, instruction.describe(machine, &block));
        }
        if failed == 0 {
            println!("✓ All {} moves placed", nodes.len());
        } else {
            println!("✗ {} of {} moves could not be placed", failed, nodes.len());
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_builds() {
        cli().debug_assert();
    }

    #[test]
    fn test_schedule_args() {
        let matches = cli()
            .try_get_matches_from(["tta-resman", "schedule", "-c", "m.toml", "-p", "p.toml", "--json"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "schedule");
        assert!(sub.get_flag("json"));
    }
}
