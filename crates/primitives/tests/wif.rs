use keypoold_primitives::{secret_key_to_wif, wif_to_secret_key, AddressError, Network};

#[test]
fn wif_roundtrips_mainnet() {
    let secret = [0x11u8; 32];

    let wif = secret_key_to_wif(&secret, Network::Mainnet, false);
    let (decoded, compressed) = wif_to_secret_key(&wif, Network::Mainnet).expect("decode");
    assert_eq!(decoded, secret);
    assert!(!compressed);

    let wif = secret_key_to_wif(&secret, Network::Mainnet, true);
    let (decoded, compressed) = wif_to_secret_key(&wif, Network::Mainnet).expect("decode");
    assert_eq!(decoded, secret);
    assert!(compressed);
}

#[test]
fn regtest_and_testnet_share_secret_prefix() {
    let secret = [0x22u8; 32];
    let wif = secret_key_to_wif(&secret, Network::Regtest, true);
    let (decoded, compressed) = wif_to_secret_key(&wif, Network::Testnet).expect("decode");
    assert_eq!(decoded, secret);
    assert!(compressed);
}

#[test]
fn wif_rejects_wrong_network() {
    let wif = secret_key_to_wif(&[0x33u8; 32], Network::Mainnet, false);
    assert_eq!(
        wif_to_secret_key(&wif, Network::Testnet).unwrap_err(),
        AddressError::UnknownPrefix
    );
}
