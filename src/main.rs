fn main() -> std::process::ExitCode {
    appthumb::run()
}
