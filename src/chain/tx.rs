// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Legacy (EIP-155) transaction encoding and signing. The batch update is
//! small and fixed-shape, so the node carries its own encoder instead of a
//! full transaction library.

use ethereum_types::{H160, H256};
use rlp::RlpStream;

use super::Error;
use crate::key::{keccak256, Signer};

pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: H160,
    pub value: u128,
    pub data: Vec<u8>,
}

fn append_tx_body(stream: &mut RlpStream, tx: &LegacyTx) {
    stream.append(&tx.nonce);
    stream.append(&tx.gas_price);
    stream.append(&tx.gas_limit);
    stream.append(&tx.to.as_bytes().to_vec());
    stream.append(&tx.value);
    stream.append(&tx.data);
}

/// Strip leading zeroes so integers encode canonically.
fn trim_be(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// RLP-encode and sign `tx` for `chain_id`, returning the raw bytes for
/// `eth_sendRawTransaction` together with the transaction hash.
pub fn sign_legacy_tx(
    signer: &Signer,
    chain_id: u64,
    tx: &LegacyTx,
) -> Result<(Vec<u8>, H256), Error> {
    // Signing payload per EIP-155: the nine-field list with
    // (chain_id, 0, 0) in place of (v, r, s).
    let mut unsigned = RlpStream::new_list(9);
    append_tx_body(&mut unsigned, tx);
    unsigned.append(&chain_id);
    unsigned.append(&Vec::<u8>::new());
    unsigned.append(&Vec::<u8>::new());

    let digest = keccak256(unsigned.out());
    let sig = signer
        .sign_digest(digest)
        .map_err(|e| Error::Tx(e.to_string()))?;

    let v = chain_id * 2 + 35 + sig.recovery_id() as u64;
    let r = trim_be(&sig.0[..32]);
    let s = trim_be(&sig.0[32..64]);

    let mut signed = RlpStream::new_list(9);
    append_tx_body(&mut signed, tx);
    signed.append(&v);
    signed.append(&r);
    signed.append(&s);

    let raw = signed.out().to_vec();
    let hash = keccak256(&raw);
    Ok((raw, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> LegacyTx {
        LegacyTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: H160::repeat_byte(0x35),
            value: 0,
            data: vec![0xde, 0xad],
        }
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = Signer::from_slice(&[0x42; 32]).unwrap();
        let (raw_a, hash_a) = sign_legacy_tx(&signer, 1, &sample_tx()).unwrap();
        let (raw_b, hash_b) = sign_legacy_tx(&signer, 1, &sample_tx()).unwrap();
        assert_eq!(raw_a, raw_b);
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn chain_id_lands_in_v() {
        let signer = Signer::from_slice(&[0x42; 32]).unwrap();
        let (raw, _) = sign_legacy_tx(&signer, 3109, &sample_tx()).unwrap();
        let decoded = rlp::Rlp::new(&raw);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);
        let v: u64 = decoded.val_at(6).unwrap();
        let recid = v - 3109 * 2 - 35;
        assert!(recid <= 1);
    }

    #[test]
    fn recovers_sender_from_signature() {
        let signer = Signer::from_slice(&[0x42; 32]).unwrap();
        let tx = sample_tx();
        let (raw, _) = sign_legacy_tx(&signer, 3109, &tx).unwrap();

        let decoded = rlp::Rlp::new(&raw);
        let v: u64 = decoded.val_at(6).unwrap();
        let r: Vec<u8> = decoded.val_at(7).unwrap();
        let s: Vec<u8> = decoded.val_at(8).unwrap();

        // Rebuild the signing payload and recover.
        let mut unsigned = RlpStream::new_list(9);
        append_tx_body(&mut unsigned, &tx);
        unsigned.append(&3109u64);
        unsigned.append(&Vec::<u8>::new());
        unsigned.append(&Vec::<u8>::new());
        let digest = keccak256(unsigned.out());

        let mut sig = [0u8; 65];
        sig[32 - r.len()..32].copy_from_slice(&r);
        sig[64 - s.len()..64].copy_from_slice(&s);
        sig[64] = (v - 3109 * 2 - 35) as u8;
        let recovered =
            crate::key::recover_address(digest, &crate::key::RecoverableSignature(sig)).unwrap();
        assert_eq!(recovered, signer.address());
    }
}
