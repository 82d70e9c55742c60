//! Command handlers.

use eyre::{eyre, WrapErr as _};
use huk_identity_core::export::public_key_pem;
use huk_identity_core::registry::KeyStatus;
use huk_identity_core::{
    cose, infer, CsrFormat, Device, EmulatedPartition, EncodeFormat, KeyId, ProvisionRecord,
    VERSION,
};

use crate::cli::{
    Cli, Command, CoseCommand, CsrCommand, InferArgs, InfoCommand, KeysCommand,
    ProvisionCommand,
};

type Shell = Device<EmulatedPartition>;

fn open_device(cli: &Cli) -> eyre::Result<Shell> {
    let config = cli.identity_config()?;
    let partition = match cli.seed {
        Some(seed) => EmulatedPartition::new(seed),
        None => {
            tracing::warn!("no --seed given, using a random hardware unique key");
            EmulatedPartition::random()
        }
    };

    let device = Device::new(partition, config);
    device.init();
    Ok(device)
}

/// Formats bytes as lowercase hex, 16 bytes per row.
fn hex_rows(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the parsed command.
pub fn run(cli: &Cli) -> eyre::Result<()> {
    match &cli.command {
        Command::Info(InfoCommand::Version) => println!("{VERSION}"),
        Command::Info(InfoCommand::Uuid) => println!("{}", open_device(cli)?.uuid()?),
        Command::Keys(KeysCommand::Status) => {
            print!("{}", open_device(cli)?.registry().status_table());
        }
        Command::Keys(KeysCommand::Public { key_id }) => keys_public(&open_device(cli)?, *key_id)?,
        Command::Csr(CsrCommand::Generate { key_id, format }) => {
            csr_generate(&open_device(cli)?, *key_id, *format)?;
        }
        Command::Cose(CoseCommand::Sign { value, format }) => {
            let encoded = open_device(cli)?.encode_value(*value, *format)?;
            println!("{}", hex::encode(encoded));
        }
        Command::Cose(CoseCommand::Verify { key_id, payload }) => {
            let bytes = hex::decode(payload.trim()).wrap_err("payload is not hex")?;
            let value = open_device(cli)?.verify(*key_id, &bytes)?;
            println!("{value}");
        }
        Command::Provision(ProvisionCommand::Demo { hubname, hubport }) => {
            provision_demo(&open_device(cli)?, hubname, *hubport)?;
        }
        Command::Infer(args) => run_inference(&open_device(cli)?, args)?,
    }
    Ok(())
}

fn keys_public(device: &Shell, key_id: Option<KeyId>) -> eyre::Result<()> {
    let key_ids: Vec<KeyId> = match key_id {
        Some(key_id) => vec![key_id],
        None => device
            .registry()
            .contexts()
            .iter()
            .filter(|context| context.status() != KeyStatus::NotProvisioned)
            .map(|context| context.key_id())
            .collect(),
    };

    for key_id in key_ids {
        let context = device.registry().context(key_id)?;
        let public_key = device.public_key(key_id)?;
        println!("{} ({key_id}):", context.label());
        println!("{}", hex_rows(&public_key));
        print!("{}", public_key_pem(&public_key)?);
    }
    Ok(())
}

fn csr_generate(device: &Shell, key_id: KeyId, format: CsrFormat) -> eyre::Result<()> {
    let csr = device.generate_csr(key_id, format)?;
    match format {
        CsrFormat::Der => println!("{}", hex_rows(&csr)),
        CsrFormat::Pem | CsrFormat::Json => {
            let text = String::from_utf8(csr).wrap_err("CSR is not text")?;
            println!("{}", text.trim_end());
        }
    }
    Ok(())
}

/// Hands a record from this thread to a waiting one.
///
/// No CA is contacted, so the client TLS CSR stands in for the certificate.
fn provision_demo(device: &Shell, hubname: &str, hubport: u16) -> eyre::Result<()> {
    let stand_in_cert = device.generate_csr(KeyId::CLIENT_TLS, CsrFormat::Der)?;

    let waited = std::thread::scope(|scope| {
        let waiter = scope.spawn(|| -> eyre::Result<Vec<u8>> {
            let record = device.wait_for_record()?;
            let mut buf = vec![0u8; record.serialized_len()];
            let len = device.provisioner().get(&mut buf)?;
            buf.truncate(len);
            Ok(buf)
        });

        device.provisioner().store(ProvisionRecord {
            cert_der: stand_in_cert,
            hubname: hubname.to_string(),
            hubport,
        });
        device
            .registry()
            .mark_certificate_issued(KeyId::CLIENT_TLS)?;

        waiter
            .join()
            .map_err(|_| eyre!("provisioning waiter panicked"))?
    })?;

    println!(
        "waiter received {} bytes (stand-in certificate, hub name, port):",
        waited.len()
    );
    println!("{}", hex_rows(&waited));
    print!("{}", device.registry().status_table());
    Ok(())
}

fn run_inference(device: &Shell, args: &InferArgs) -> eyre::Result<()> {
    let inputs: Vec<f32> = match args.input {
        Some(x) => vec![x],
        None => {
            let steps = args.steps.max(1);
            (0..=steps)
                .map(|step| {
                    (infer::X_RANGE * f32::from(step) / f32::from(steps)).min(infer::X_RANGE)
                })
                .collect()
        }
    };

    let public_key = device.public_key(KeyId::COSE_SIGN)?;
    for x in inputs {
        let mut out = vec![0u8; device.config().cose_buffer_size];
        let (y, len) = args.engine.infer_and_encode(
            device.service(),
            device.registry(),
            x,
            EncodeFormat::CoseSign1,
            &mut out,
        )?;
        let verified = cose::verify(&out[..len], &public_key)?;
        tracing::debug!("signed payload:\n{}", hex_rows(&out[..len]));
        println!(
            "{engine}: sin({x:.4}) = {verified:.6} (libm {:.6}, deviation {:.6})",
            x.sin(),
            (x.sin() - y).abs(),
            engine = args.engine,
        );
    }
    Ok(())
}
