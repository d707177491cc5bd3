/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Post-training LQ quantization for LQNN models.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use lqnn::error::format_chain;
use lqnn::LqResult;
use lqnn_trainer::Quantizer;

#[derive(Debug, Parser)]
#[command(
    name = "lquantizer",
    version,
    about = "Provide LQ post-training quantization for LQNN models"
)]
struct LquantizerArgs {
    /// Input model filepath
    #[arg(long = "input_model", required = true)]
    input_model: String,

    /// Input data filepath. If not given, lquantizer will run with randomly
    /// generated data. Note that the random dataset does not represent
    /// inference workload, leading to poor model accuracy.
    #[arg(long = "input_data")]
    input_data: Option<String>,

    /// Output model filepath
    #[arg(long = "output_model", required = true)]
    output_model: String,

    /// Quantization bits count per parameter value, applied to both inputs
    /// and weights
    #[arg(long = "encode_bits", value_parser = clap::value_parser!(u32).range(1..32))]
    encode_bits: Option<u32>,
}

fn run(args: LquantizerArgs) -> LqResult<()> {
    let mut quantizer = match args.encode_bits {
        Some(bits) => Quantizer::with_encode_bits(bits as usize),
        None => Quantizer::new(),
    };

    quantizer.initialize(&args.input_model)?;

    if let Some(input_data) = &args.input_data {
        quantizer.path_to_input_data(input_data);
    }

    quantizer.train()?;
    quantizer.save(&args.output_model)?;

    Ok(())
}

fn main() -> ExitCode {
    let args = match LquantizerArgs::try_parse() {
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
