use std::process::ExitCode;

fn main() -> ExitCode {
    maestro_setup::main_entry()
}
