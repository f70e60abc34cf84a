fn main() {
    if let Err(err) = task_alarm_lib::run() {
        eprintln!("task-alarm: {err}");
        std::process::exit(1);
    }
}
