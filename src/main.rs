fn main() {
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(towerpick_lib::run(args));
}
