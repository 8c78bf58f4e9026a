use std::ffi::OsString;

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    let code = stmpo::core::main::run_stmpo(args);
    log::logger().flush();
    std::process::exit(code);
}
