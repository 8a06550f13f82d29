use clap::Parser;
use mir::Arch;
use mir::machines;

/// Print the machine model the runtime would use.
#[derive(Parser, Debug)]
#[command(name = "mir-arch")]
struct Args {
    /// Predefined machine to show instead of the detected one
    #[arg(long)]
    arch: Option<String>,

    /// List the predefined machines
    #[arg(short, long)]
    list: bool,
}

fn main() {
    let args = Args::parse();
    if args.list {
        for name in machines::names() {
            println!("{name}");
        }
        return;
    }

    let arch = match args.arch.as_deref() {
        Some(name) => match Arch::by_name(name) {
            Some(arch) => arch,
            None => {
                eprintln!("unknown architecture `{name}`");
                std::process::exit(1);
            }
        },
        None => Arch::detect(),
    };

    println!("Architecture: {}", arch.name());
    println!("Cores: {}  Nodes: {}  Diameter: {}", arch.num_cores(), arch.num_nodes(), arch.diameter());
    println!("LLC: {} KB", arch.llc_size_kb());
    for node in 0..arch.num_nodes() {
        let cpus: Vec<usize> = arch.cores_of(node).iter().map(|&c| arch.sys_cpu_of(c)).collect();
        println!("Node {node}: cores {:?} (os cpus {:?})", arch.cores_of(node), cpus);
    }
    if arch.num_nodes() > 1 {
        println!("Cost matrix:");
        for from in 0..arch.num_nodes() {
            let row: Vec<String> = (0..arch.num_nodes())
                .map(|to| format!("{:>3}", arch.comm_cost(from, to)))
                .collect();
            println!("  {}", row.join(" "));
        }
        for node in 0..arch.num_nodes() {
            let rings: Vec<&[usize]> = (1..=arch.diameter()).map(|d| arch.vicinity(node, d)).collect();
            println!("Vicinity of {node}: {rings:?}");
        }
    }
}
