/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Run a model over every record of a dataset and record its outputs.
//!
//! One `<record>.data` text file of space-separated floats is written per
//! record; the average inference time is printed at the end.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use clap::error::ErrorKind;
use clap::Parser;
use lqnn::error::format_chain;
use lqnn::{DataType, LqError, LqResult};
use lqnn_graph::{Model, Op};
use lqnn_interpreter::{Interpreter, NullObserver};
use lqnn_trainer::DatasetReader;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "output_recorder",
    version,
    about = "Record per-record model outputs for a dataset"
)]
struct OutputRecorderArgs {
    /// Input model filepath
    #[arg(long = "input_model", required = true)]
    input_model: String,

    /// Input data filepath
    #[arg(long = "input_data", required = true)]
    input_data: String,

    /// Directory the per-record output files are written to
    #[arg(long = "output_dir", required = true)]
    output_dir: String,
}

fn run(args: OutputRecorderArgs) -> LqResult<()> {
    let model = Model::load(&args.input_model)?;
    let mut interpreter = Interpreter::new(&model.graph)?;

    let reader = DatasetReader::open(&args.input_data)?;
    let num_records = reader.num_records();
    if num_records == 0 {
        return Err(LqError::DataCorrupt(
            "the input data file does not contain any record".to_string(),
        ));
    }

    let input_nodes = model.graph.inputs().to_vec();
    let output_nodes = model.graph.outputs();
    let [output_node] = output_nodes else {
        return Err(LqError::InvariantViolation(format!(
            "recording supports exactly one model output, got {}",
            output_nodes.len()
        )));
    };
    let output_node = *output_node;

    let is_raw = reader.is_raw_data();
    let mut overall_time_us: u128 = 0;

    for record in 0..num_records {
        if reader.num_inputs(record) != input_nodes.len() {
            return Err(LqError::DataCorrupt(format!(
                "record {} carries {} inputs but the model declares {}",
                record,
                reader.num_inputs(record),
                input_nodes.len()
            )));
        }

        if record % 100 == 0 {
            info!(record, "recording");
        }

        for (input_idx, &input_node) in input_nodes.iter().enumerate() {
            let Op::Input { dtype, shape } = &model.graph.node(input_node).op else {
                continue;
            };

            let values = if is_raw {
                // Raw records skip the type/shape check.
                reader.read_tensor_raw(record, input_idx)?
            } else {
                let (record_shape, values) = reader.read_tensor(record, input_idx)?;
                if *dtype != DataType::F32 {
                    return Err(LqError::DataCorrupt(format!(
                        "input {input_idx} is declared {dtype}, datasets carry f32"
                    )));
                }
                if record_shape != *shape {
                    return Err(LqError::DataCorrupt(format!(
                        "record {} input {} has shape {:?}, the model declares {:?}",
                        record,
                        input_idx,
                        record_shape.dims(),
                        shape.dims()
                    )));
                }
                values
            };

            if values.len() != shape.num_elements() {
                return Err(LqError::DataCorrupt(format!(
                    "record {} input {} has {} values, the model declares {}",
                    record,
                    input_idx,
                    values.len(),
                    shape.num_elements()
                )));
            }

            interpreter.write_input(input_node, &values)?;
        }

        let start = Instant::now();
        interpreter.run(&mut NullObserver)?;
        overall_time_us += start.elapsed().as_micros();

        let output = interpreter.read_output(output_node)?;
        let values = output.as_f32().ok_or_else(|| {
            LqError::InvariantViolation("model output is not f32".to_string())
        })?;

        let mut line = String::new();
        for value in values {
            let _ = write!(line, "{} ", value);
        }
        line.push('\n');

        let path = Path::new(&args.output_dir).join(format!("{record}.data"));
        fs::write(&path, line).map_err(|e| LqError::io(path.display().to_string(), e))?;
    }

    println!("Recording finished. Number of recorded data: {num_records}");
    println!(
        "Average time: {}",
        overall_time_us as f64 / num_records as f64
    );

    Ok(())
}

fn main() -> ExitCode {
    let args = match OutputRecorderArgs::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(255);
        }
    };

    lqnn_tools::init_subscriber();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", format_chain(&err));
            ExitCode::FAILURE
        }
    }
}
