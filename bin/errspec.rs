// Command-line front door: parse the module and the seed files, run the
// requested pipeline, print records to stdout (or --output).

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::Write as _;
use std::process::exit;

use clap::{Parser, Subcommand};

use errspec::commons::Valid;
use errspec::front_end::parse_module;
use errspec::middle_end::analysis::{return_constraints, return_propagation, returned_values};
use errspec::middle_end::constraint::{Constraint, Interval};
use errspec::middle_end::error_blocks::{parse_error_only, ErrorBlocks, ErrorCodeList};
use errspec::middle_end::ir::Module;
use errspec::middle_end::missing_checks::{self, MissingChecksConfig};
use errspec::middle_end::spec_file;

#[derive(Parser)]
#[command(name = "errspec", about = "Infer and check error specifications for IR modules")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Infer an error specification for every function in the module
    Specs {
        #[arg(long)]
        ir: String,
        #[arg(long)]
        erroronly: String,
        #[arg(long)]
        inputspecs: Option<String>,
        #[arg(long)]
        errorcodes: Option<String>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Report unchecked calls and inconsistent error handling
    Bugs {
        #[arg(long)]
        ir: String,
        #[arg(long)]
        specs: String,
        #[arg(long)]
        erroronly: String,
        #[arg(long)]
        debugfunction: Option<String>,
        #[arg(long)]
        conflate_checks: bool,
        #[arg(long)]
        filter_void: bool,
        #[arg(long, default_value_t = 25)]
        check_distance: u32,
        #[arg(long)]
        output: Option<String>,
    },
    /// Render the error-propagation graph
    Errorpropagation {
        #[arg(long)]
        ir: String,
        #[arg(long)]
        erroronly: String,
        #[arg(long)]
        inputspecs: Option<String>,
        #[arg(long)]
        errorcodes: Option<String>,
        #[arg(long)]
        output: Option<String>,
    },
    /// Render the full returned-value propagation graph
    Fullpropagation {
        #[arg(long)]
        ir: String,
        #[arg(long)]
        output: Option<String>,
    },
    /// List the functions defined in the module
    Definedfunctions {
        #[arg(long)]
        ir: String,
    },
    /// List the callee of every direct call site
    Calledfunctions {
        #[arg(long)]
        ir: String,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    match cli.command {
        Command::Specs {
            ir,
            erroronly,
            inputspecs,
            errorcodes,
            output,
        } => {
            let module = load_module(&ir);
            let blocks = run_inference(&module, &erroronly, inputspecs.as_deref(), errorcodes.as_deref());

            let mut out = String::new();
            for (fname, aerv) in blocks.specs() {
                let _ = writeln!(out, "{fname}: {aerv}");
            }
            emit(output.as_deref(), &out);
        }

        Command::Bugs {
            ir,
            specs,
            erroronly,
            debugfunction,
            conflate_checks,
            filter_void,
            check_distance,
            output,
        } => {
            let module = load_module(&ir);
            let rp = return_propagation::analyze(&module);
            let rc = return_constraints::analyze(&module, &rp);

            if let Some(fname) = &debugfunction {
                match module.func_by_name(fname) {
                    Some(func) => rp.dump(&module, func),
                    None => eprintln!("WARNING: no function named {fname} to debug"),
                }
            }

            let specs = load_final_specs(&specs);
            let error_only = load_error_only(&erroronly);
            let config = MissingChecksConfig {
                conflate_checks,
                filter_void,
                check_distance,
            };
            let report = missing_checks::run(&module, &rp, &rc, specs, error_only, config);

            let mut out = String::new();
            for bug in &report.inconsistent {
                let _ = writeln!(
                    out,
                    "{} {} {} {} {}",
                    bug.loc, bug.success.fname, bug.success.interval, bug.spec.fname, bug.spec.interval
                );
            }
            for call in &report.unchecked {
                let _ = writeln!(
                    out,
                    "{} {} {} {}",
                    call.loc,
                    call.fname,
                    report.unchecked_calls[&call.fname],
                    report.checked_calls[&call.fname]
                );
            }
            emit(output.as_deref(), &out);
        }

        Command::Errorpropagation {
            ir,
            erroronly,
            inputspecs,
            errorcodes,
            output,
        } => {
            let module = load_module(&ir);
            let blocks = run_inference(&module, &erroronly, inputspecs.as_deref(), errorcodes.as_deref());

            let mut out = String::new();
            let _ = writeln!(out, "digraph error_prop {{");
            for (from, to) in &blocks.error_propagation {
                let from_interval = aerv_interval(&blocks, from);
                let to_interval = aerv_interval(&blocks, to);
                let _ = writeln!(
                    out,
                    "\"{} {}\" -> \"{} {}\"",
                    bootstrap_label(&blocks, from),
                    from_interval,
                    bootstrap_label(&blocks, to),
                    to_interval
                );
            }
            let _ = writeln!(out, "}}");
            emit(output.as_deref(), &out);
        }

        Command::Fullpropagation { ir, output } => {
            let module = load_module(&ir);
            let rv = returned_values::analyze(&module);

            // No specs are computed in this mode, so every node renders with
            // the bottom interval.
            let mut out = String::new();
            let _ = writeln!(out, "digraph full_prop {{");
            for (fname, callees) in &rv.return_propagated {
                if fname.contains('.') {
                    continue;
                }
                for callee in callees {
                    if callee.contains('.') {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "\"{callee}({bot})\" -> \"{fname}({bot})\"",
                        bot = Interval::Bot
                    );
                }
            }
            let _ = writeln!(out, "}}");
            emit(output.as_deref(), &out);
        }

        Command::Definedfunctions { ir } => {
            let module = load_module(&ir);
            let mut out = String::new();
            for func in &module.functions {
                if !func.is_defined() {
                    continue;
                }
                let name = func.name.split('.').next().unwrap();
                let _ = writeln!(out, "{} {}", func.ret_ty, name);
            }
            emit(None, &out);
        }

        Command::Calledfunctions { ir } => {
            let module = load_module(&ir);
            let mut out = String::new();
            for func in module.func_ids() {
                for i in module.func_insts(func) {
                    if let Some(callee) = module.callee_name(i) {
                        let _ = writeln!(out, "{callee}");
                    }
                }
            }
            emit(None, &out);
        }
    }
}

// SECTION: pipeline plumbing

fn run_inference(
    module: &Valid<Module>,
    erroronly: &str,
    inputspecs: Option<&str>,
    errorcodes: Option<&str>,
) -> ErrorBlocks {
    let rp = return_propagation::analyze(module);
    let rv = returned_values::analyze(module);
    let rc = return_constraints::analyze(module, &rp);

    let error_only = load_error_only(erroronly);
    let input_specs = load_input_specs(inputspecs);
    let codes = load_error_codes(errorcodes);

    let mut blocks = ErrorBlocks::new(error_only, input_specs, codes);
    blocks.run(module, &rp, &rv, &rc);
    blocks
}

fn aerv_interval(blocks: &ErrorBlocks, fname: &str) -> Interval {
    match blocks.aerv(fname) {
        Some(aerv) => aerv.interval,
        None => {
            eprintln!("ERROR: no AERV for function {fname}");
            Interval::Bot
        }
    }
}

fn bootstrap_label(blocks: &ErrorBlocks, fname: &str) -> String {
    if blocks.error_only_bootstrap.contains(fname) {
        format!("{fname}(EO)")
    } else {
        fname.to_string()
    }
}

// SECTION: input loading

fn load_module(path: &str) -> Valid<Module> {
    let code = read_or_die(path);
    match parse_module(&code) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("FATAL: error parsing IR module {path}: {err}");
            std::process::abort();
        }
    }
}

fn load_error_only(path: &str) -> Set<String> {
    parse_error_only(&read_or_die(path))
}

fn load_input_specs(path: Option<&str>) -> Map<String, Constraint> {
    let Some(path) = path else {
        return Map::new();
    };
    match spec_file::parse_input_specs(&read_or_die(path)) {
        Ok(specs) => specs,
        Err(err) => {
            eprintln!("ERROR: bad input specs file {path}: {err}");
            exit(1);
        }
    }
}

fn load_final_specs(path: &str) -> Map<String, Constraint> {
    match spec_file::parse_final_specs(&read_or_die(path)) {
        Ok(specs) => specs,
        Err(err) => {
            eprintln!("ERROR: bad specs file {path}: {err}");
            exit(1);
        }
    }
}

fn load_error_codes(path: Option<&str>) -> ErrorCodeList {
    let Some(path) = path else {
        return ErrorCodeList::default();
    };
    match serde_json::from_str(&read_or_die(path)) {
        Ok(codes) => codes,
        Err(err) => {
            eprintln!("ERROR: bad error-code file {path}: {err}");
            exit(1);
        }
    }
}

fn read_or_die(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("ERROR: could not read {path}: {err}");
            exit(1);
        }
    }
}

// SECTION: output

fn emit(path: Option<&str>, text: &str) {
    match path {
        Some(path) => {
            if let Err(err) = std::fs::write(path, text) {
                eprintln!("ERROR: could not write {path}: {err}");
                exit(1);
            }
        }
        None => print!("{text}"),
    }
}
