//! chat-transformer 命令行
//!
//! ```bash
//! chat-transformer train --epochs 50
//! chat-transformer chat --model models/
//! chat-transformer demo
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use chat_transformer::{
    ChatBot, ChatConfig, ChatTransformer, CheckpointManager, Result, Tokenizer, Trainer,
    TrainingData,
};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// 训练后用来检查模型的示例问题
const SAMPLE_PROMPTS: &[&str] = &[
    "hola",
    "muéstrame las estadísticas",
    "cuántas citas hay hoy",
    "dame el reporte de ventas",
];

/// demo 子命令额外使用的问题
const DEMO_PROMPTS: &[&str] = &[
    "¿qué vacunas necesita mi cachorro?",
    "qué comida le doy a mi gato",
    "es urgente, mi perro no respira bien",
    "qué puedes hacer",
    "adiós, gracias",
];

#[derive(Parser)]
#[command(name = "chat-transformer", version, about = "从零实现的对话 Transformer")]
struct Cli {
    /// 输出 debug 级别日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 训练模型并保存到模型目录
    Train {
        /// JSON 配置文件
        #[arg(long)]
        config: Option<PathBuf>,
        /// 训练轮数（覆盖配置）
        #[arg(long)]
        epochs: Option<usize>,
        /// 训练数据文件（覆盖配置）
        #[arg(long)]
        data: Option<PathBuf>,
        /// 输出目录（覆盖配置）
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// 交互式对话
    Chat {
        /// 模型目录
        #[arg(long)]
        model: Option<PathBuf>,
        /// JSON 配置文件
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 不加载模型，展示关键词回复
    Demo,
}

fn load_config(path: Option<&PathBuf>) -> Result<ChatConfig> {
    match path {
        Some(path) => ChatConfig::load(path),
        None => Ok(ChatConfig::default()),
    }
}

fn print_reply(bot: &ChatBot, message: &str, rng: &mut StdRng) {
    let reply = bot.process_message(message, rng);
    println!("\n👤 Usuario: {}", message);
    println!("🤖 Bot ({}): {}", reply.model, reply.response);
    println!("   Confianza: {:.0}%", reply.confidence * 100.0);
}

fn train(
    config: Option<PathBuf>,
    epochs: Option<usize>,
    data: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config.as_ref())?;
    if let Some(data) = data {
        config.paths.data = data;
    }
    if let Some(out) = out {
        config.paths.model_dir = out;
    }
    let epochs = epochs.unwrap_or(config.training.epochs);

    // 1. 数据和词表
    let data = TrainingData::load_or_default(&config.paths.data)?;
    let mut tokenizer = Tokenizer::new();
    tokenizer.build(&data.corpus(), config.max_words);

    // 2. 模型
    let model_config = config.model.with_vocab_size(tokenizer.vocab_size()?);
    let pairs = data.encode_pairs(&tokenizer, model_config.max_seq_len)?;
    let model = ChatTransformer::with_rng(
        model_config,
        &mut StdRng::seed_from_u64(config.training.seed),
    );
    log::info!("{}", model.info());

    // 3. 训练
    let manager = CheckpointManager::new(&config.paths.model_dir, config.training.save_every)?;
    let mut trainer = Trainer::new(model, config.training).with_checkpoints(manager);
    let history = trainer.fit(&pairs, epochs)?;
    log::info!("{}", history.summary());

    // 4. 保存并试用
    let bot = ChatBot::with_model(tokenizer, trainer.into_model()).with_settings(config.chat);
    bot.save(&config.paths.model_dir)?;

    let mut rng = StdRng::seed_from_u64(config.training.seed);
    println!("\n🧪 Probando el modelo entrenado...");
    for prompt in SAMPLE_PROMPTS {
        print_reply(&bot, prompt, &mut rng);
    }
    Ok(())
}

fn chat(model: Option<PathBuf>, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let dir = model.unwrap_or(config.paths.model_dir);

    let bot = match ChatBot::load(&dir) {
        Ok(bot) => bot.with_settings(config.chat),
        Err(e) => {
            log::warn!("无法加载模型 ({})，只使用关键词回复", e);
            ChatBot::fallback_only()
        }
    };

    println!("🐾 PetBot listo. Escribe 'salir' para terminar.");
    let mut rng = StdRng::from_entropy();
    let stdin = io::stdin();
    loop {
        print!("\n👤 > ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "salir" | "exit" | "quit") {
            break;
        }

        let (response, confidence) = bot.respond(message, &mut rng);
        println!("🤖 {} ({:.0}%)", response, confidence * 100.0);
    }
    println!("¡Hasta pronto! 👋");
    Ok(())
}

fn demo() {
    let bot = ChatBot::fallback_only();
    let mut rng = StdRng::seed_from_u64(42);
    for prompt in SAMPLE_PROMPTS.iter().chain(DEMO_PROMPTS) {
        print_reply(&bot, prompt, &mut rng);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("日志初始化失败: {}", e);
    }

    let result = match cli.command {
        Command::Train {
            config,
            epochs,
            data,
            out,
        } => train(config, epochs, data, out),
        Command::Chat { model, config } => chat(model, config),
        Command::Demo => {
            demo();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
