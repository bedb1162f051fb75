//! Worker process with the built-in function registry.

fn main() -> std::process::ExitCode {
    forkline::worker::main(forkline::engine::Registry::with_builtins())
}
