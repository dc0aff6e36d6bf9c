//! Worker host with a fixed set of well-behaved and misbehaving programs.
//! The integration tests drive the harness against it.

use std::fs;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use harness::error::Fault;
use harness::unit::{Program, RegistryError, UnitRegistry};
use serde_json::{Value, json};

fn sum(args: &[Value]) -> Value {
    json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
}

fn registry() -> Result<UnitRegistry, RegistryError> {
    let mut registry = UnitRegistry::new();

    registry.register(
        "echo",
        Program::new().main(|ctx, _| {
            let line = ctx.input()?;
            ctx.print(line);
            Ok(Value::Null)
        }),
    )?;

    registry.register(
        "reader",
        Program::new().main(|ctx, _| {
            let first = ctx.input()?;
            let second = ctx.input()?;
            ctx.print(format!("{first} {second}"));
            Ok(Value::Null)
        }),
    )?;

    registry.register(
        "spin",
        Program::new().main(|ctx, _| {
            ctx.print("started");
            loop {
                thread::sleep(Duration::from_millis(50));
            }
        }),
    )?;

    registry.register(
        "flood",
        Program::new().main(|ctx, _| {
            let line = "x".repeat(100);
            for _ in 0..10_000 {
                ctx.print(&line);
            }
            Ok(Value::Null)
        }),
    )?;

    registry.register(
        "calc",
        Program::new()
            .function("mock_me", |_, args| Ok(sum(args)))
            .function("run_me", |ctx, _| {
                ctx.call("mock_me", &mut [json!(1), json!(2), json!(3)])?;
                ctx.call("mock_me", &mut [json!(1), json!(2), json!(3)])
            })
            .function("push_one", |_, args| {
                if let Some(Value::Array(items)) = args.get_mut(0) {
                    items.push(json!(1));
                }
                Ok(Value::Null)
            })
            .function("apply", |ctx, args| {
                let reference = args.first().cloned().unwrap_or(Value::Null);
                ctx.call_ref(&reference, &mut [json!(2), json!(3)])
            })
            .function("init", |ctx, _| {
                ctx.print("initialised");
                Ok(Value::Null)
            }),
    )?;

    registry.register(
        "raiser",
        Program::new().main(|_, _| Err(Fault::raised("raise boi has spoken"))),
    )?;

    registry.register(
        "panicker",
        Program::new().main(|_, _| panic!("kaboom")),
    )?;

    registry.register(
        "exiter",
        Program::new().main(|ctx, _| {
            ctx.print("about to leave");
            std::process::exit(0)
        }),
    )?;

    registry.register(
        "writer",
        Program::new().main(|ctx, _| {
            let input = fs::read_to_string("input.txt")
                .map_err(|e| Fault::raised(format!("read input.txt: {e}")))?;
            fs::write("result.txt", input.to_uppercase())
                .map_err(|e| Fault::raised(format!("write result.txt: {e}")))?;
            ctx.print("OUTPUT written");
            Ok(Value::Null)
        }),
    )?;

    Ok(registry)
}

fn main() -> ExitCode {
    match registry() {
        Ok(registry) => harness::worker::serve(&registry),
        Err(err) => {
            eprintln!("fixture-worker: {err}");
            ExitCode::FAILURE
        }
    }
}
