use mesh_common::crypto;
use heapless::Vec;

/// Completion of a single engine step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcmCompletion {
    Init,
    Digest,
    Encrypt,
    Decrypt { mic_ok: bool },
}

/// An AES-CCM engine processing one operation at a time.
///
/// An operation is a sequence of submitted steps: `init`, an optional
/// `digest` for additional authenticated data, then `encrypt` or
/// `decrypt`. Each submission transforms its buffers before returning,
/// but completion may be signalled later through
/// [`poll_complete`](Self::poll_complete) — a hardware-backed engine
/// raises an event and the owner re-enters the scheduler, a software
/// engine completes immediately. The caller must not submit a step
/// while a previous one has not completed.
pub trait CcmEngine {
    fn init(
        &mut self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        crypt_len: usize,
        aad_len: usize,
        mic_len: usize,
    );

    /// Submit additional authenticated data (the 16-byte label UUID of
    /// a virtual destination).
    fn digest(&mut self, aad: &[u8]);

    /// Encrypt `data` in place; the authentication tag becomes
    /// available through [`authentication_value`](Self::authentication_value).
    fn encrypt(&mut self, data: &mut [u8]);

    /// Decrypt `data` in place and verify it against the received
    /// `mic`. The comparison is constant-time.
    fn decrypt(&mut self, data: &mut [u8], mic: &[u8]);

    /// Copy the tag of the last completed encryption into `mic`.
    fn authentication_value(&self, mic: &mut [u8]);

    /// Take the completion of the last submitted step, if it has
    /// finished.
    fn poll_complete(&mut self) -> Option<CcmCompletion>;
}

/// Software engine backed by the AES-CCM implementation in
/// `mesh-common`; every step completes synchronously.
#[derive(Default)]
pub struct SoftwareCcm {
    key: [u8; 16],
    nonce: [u8; 13],
    aad: Vec<u8, 16>,
    mic_len: usize,
    tag: [u8; 8],
    completion: Option<CcmCompletion>,
}

impl SoftwareCcm {
    pub fn new() -> Self {
        Default::default()
    }

    fn aad(&self) -> Option<&[u8]> {
        if self.aad.is_empty() {
            None
        } else {
            Some(&self.aad)
        }
    }
}

impl CcmEngine for SoftwareCcm {
    fn init(
        &mut self,
        key: &[u8; 16],
        nonce: &[u8; 13],
        _crypt_len: usize,
        _aad_len: usize,
        mic_len: usize,
    ) {
        self.key = *key;
        self.nonce = *nonce;
        self.aad.clear();
        self.mic_len = mic_len;
        self.completion = Some(CcmCompletion::Init);
    }

    fn digest(&mut self, aad: &[u8]) {
        self.aad.clear();
        self.aad.extend_from_slice(aad).ok();
        self.completion = Some(CcmCompletion::Digest);
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        let mic_len = self.mic_len;
        let mut tag = self.tag;
        let result = crypto::aes_ccm_encrypt_detached(
            &self.key,
            &self.nonce,
            data,
            &mut tag[..mic_len],
            self.aad(),
        );
        debug_assert!(result.is_ok());
        self.tag = tag;
        self.completion = Some(CcmCompletion::Encrypt);
    }

    fn decrypt(&mut self, data: &mut [u8], mic: &[u8]) {
        let result =
            crypto::aes_ccm_decrypt_detached(&self.key, &self.nonce, data, mic, self.aad());
        self.completion = Some(CcmCompletion::Decrypt {
            mic_ok: result.is_ok(),
        });
    }

    fn authentication_value(&self, mic: &mut [u8]) {
        mic.copy_from_slice(&self.tag[..mic.len()]);
    }

    fn poll_complete(&mut self) -> Option<CcmCompletion> {
        self.completion.take()
    }
}
