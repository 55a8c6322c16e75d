use std::env;
use std::fs;
use std::path::PathBuf;

use color_eyre::eyre::{bail, eyre, WrapErr};
use log::info;

use mem_static_detector::detector::{Detector, MemLeak, NullPointer};
use mem_static_detector::ir::Program;
use mem_static_detector::pointer_analysis::MemObject;
use mem_static_detector::{analyze, analyze_pointers, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorType {
    Leak,
    Null,
    Pts,
}

impl DetectorType {
    fn from_env() -> color_eyre::Result<Self> {
        match env::var("DETECTOR_TYPE") {
            Ok(value) if value == "LEAK" => Ok(DetectorType::Leak),
            Ok(value) if value == "NULL" => Ok(DetectorType::Null),
            Ok(value) if value == "PTS" => Ok(DetectorType::Pts),
            Ok(value) => bail!("DETECTOR_TYPE set to `{}`, expected LEAK, NULL or PTS", value),
            Err(_) => Ok(DetectorType::Leak),
        }
    }
}

fn describe(program: &Program, obj: &MemObject) -> String {
    match obj {
        MemObject::Universal => "<universal>".to_owned(),
        MemObject::Null => "null".to_owned(),
        MemObject::Value(v) => program.value_name(*v),
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let path: PathBuf = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("usage: mem-static-detector <program.json>"))?;
    let detector = DetectorType::from_env()?;
    let config = Config::from_env()?;

    let text = fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let program = Program::from_json(&text)
        .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
    info!("loaded {} ({:?}, {:?})", path.display(), detector, config);

    match detector {
        DetectorType::Pts => {
            let (pta, callgraph) = analyze_pointers(&program, &config)?;
            info!("{:?}", pta.stats());
            for inst in &program.insts {
                if !program.is_pointer(inst.value) {
                    continue;
                }
                let objs: Vec<String> = pta
                    .points_to(inst.value)?
                    .iter()
                    .map(|obj| describe(&program, obj))
                    .collect();
                println!("{} -> {{{}}}", program.value_name(inst.value), objs.join(", "));
            }
            for site in callgraph.failed_call_sites() {
                println!("unresolved call: {}", program.source_loc(site));
            }
        }
        DetectorType::Null => {
            let (pta, _) = analyze_pointers(&program, &config)?;
            for report in NullPointer::new(&pta).run()? {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        DetectorType::Leak => {
            let dg = analyze(&program, &config)?;
            if config.dump_cfg {
                fs::write("CFG.dot", dg.cfg_dot()).wrap_err("failed to write CFG.dot")?;
            }
            if config.dump_ddg {
                fs::write("DDG.dot", dg.ddg_dot()).wrap_err("failed to write DDG.dot")?;
            }
            for report in MemLeak::new(&dg).run()? {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }
    Ok(())
}
