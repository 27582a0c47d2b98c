//! Certificate and keystore fixtures generated on the fly for tests

use std::{
    io::Write,
    net::{SocketAddr, TcpListener},
    thread::{self, JoinHandle},
};

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    ssl::{SslAcceptor, SslMethod},
    symm::Cipher,
    x509::{extension::BasicConstraints, X509Builder, X509NameBuilder, X509},
};

pub(crate) fn generate_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build_certificate(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    ca: bool,
) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some((issuer_cert, _)) => builder.set_issuer_name(issuer_cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    }

    let signer = issuer.map_or(key, |(_, issuer_key)| issuer_key);
    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}

pub(crate) fn self_signed(common_name: &str) -> (X509, PKey<Private>) {
    let key = generate_key();
    let cert = build_certificate(common_name, &key, None, false);
    (cert, key)
}

/// Root, intermediate and leaf certificates chained together
pub(crate) struct TestChain {
    pub root: X509,
    pub intermediate: X509,
    pub leaf: X509,
    pub leaf_key: PKey<Private>,
}

impl TestChain {
    pub(crate) fn generate() -> Self {
        let root_key = generate_key();
        let root = build_certificate("pushkeys test root", &root_key, None, true);

        let intermediate_key = generate_key();
        let intermediate = build_certificate(
            "pushkeys test intermediate",
            &intermediate_key,
            Some((&root, &root_key)),
            true,
        );

        let leaf_key = generate_key();
        let leaf = build_certificate(
            "localhost",
            &leaf_key,
            Some((&intermediate, &intermediate_key)),
            false,
        );

        TestChain {
            root,
            intermediate,
            leaf,
            leaf_key,
        }
    }
}

/// A PKCS#12 keystore holding one key entry named `alias`
pub(crate) fn pkcs12_bytes(alias: &str, password: &str) -> Vec<u8> {
    let (cert, key) = self_signed("pushkeys.localhost");

    Pkcs12::builder()
        .name(alias)
        .pkey(&key)
        .cert(&cert)
        .build2(password)
        .unwrap()
        .to_der()
        .unwrap()
}

/// A PEM bundle with a certificate and its key, encrypted when a password is given
pub(crate) fn pem_bundle(password: Option<&str>) -> Vec<u8> {
    let (cert, key) = self_signed("pem.localhost");

    let mut bundle = cert.to_pem().unwrap();
    let key_pem = match password {
        Some(password) => key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), password.as_bytes())
            .unwrap(),
        None => key.private_key_to_pem_pkcs8().unwrap(),
    };
    bundle.write_all(&key_pem).unwrap();
    bundle
}

/// Serves a single TLS handshake presenting leaf, intermediate and root
pub(crate) fn spawn_tls_server(chain: &TestChain) -> (SocketAddr, JoinHandle<()>) {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    acceptor.set_private_key(&chain.leaf_key).unwrap();
    acceptor.set_certificate(&chain.leaf).unwrap();
    acceptor.add_extra_chain_cert(chain.intermediate.clone()).unwrap();
    acceptor.add_extra_chain_cert(chain.root.clone()).unwrap();
    let acceptor = acceptor.build();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            // The client aborts once it has seen an untrusted chain
            let _ = acceptor.accept(stream);
        }
    });

    (address, handle)
}
