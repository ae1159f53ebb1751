fn main() -> std::process::ExitCode {
    trace_fleet_lib::run()
}
