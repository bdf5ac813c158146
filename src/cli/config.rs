use crate::config::default_config_paths;
use crate::config::generate::generate_starter_config;
use crate::plugin::PluginRegistry;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // First default location whose directory can be created
    let Some(config_path) = default_config_paths().into_iter().find(|path| {
        path.parent()
            .is_some_and(|parent| fs::create_dir_all(parent).is_ok())
    }) else {
        return Err("could not create a config directory in any default location".into());
    };

    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    let result = crate::config::load_config(&path)
        .and_then(|config| config.processors(&PluginRegistry::with_builtins()));
    match result {
        Ok(processors) => {
            println!("✓ Config is valid ({} plugin sections)", processors.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
