//! 测试辅助：自签名证书与进程级加密后端安装。
//!
//! 仅用于测试场景，生成的证书不具备生产级安全属性。

use crate::context::ReloadableTlsConfig;
use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::{Arc, Once};

/// 确保 AWS-LC 作为 rustls 的全局加密后端；可重复调用。
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // 其他测试可能已安装同一 provider，重复安装的失败可以忽略。
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// 一份自签名身份：服务端证书链与私钥，以及仅信任该证书的客户端配置。
pub struct SelfSigned {
    server: Arc<ServerConfig>,
    certificate: CertificateDer<'static>,
}

impl SelfSigned {
    /// 以 `common_name` 作为 CN 与 SAN 生成证书。
    pub fn generate(common_name: &str) -> anyhow::Result<Self> {
        ensure_crypto_provider();

        let mut params = CertificateParams::new(vec![common_name.to_string()])
            .context("构造证书参数失败")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().context("生成证书私钥失败")?;
        let certificate = params
            .self_signed(&key_pair)
            .context("签发自签名证书失败")?;
        let certificate = CertificateDer::from(certificate.der().to_vec());
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], private_key)
            .context("构建服务端 TLS 配置失败")?;
        Ok(Self {
            server: Arc::new(server),
            certificate,
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server)
    }

    /// 仅信任本证书的客户端配置。
    pub fn client_config(&self) -> anyhow::Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.certificate.clone())
            .context("将证书写入 Root Store 失败")?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    /// 同时持有两端配置的上下文，便于一份上下文覆盖客户端与服务端。
    pub fn context(&self) -> anyhow::Result<ReloadableTlsConfig> {
        Ok(ReloadableTlsConfig::new(
            Some(self.client_config()?),
            Some(self.server_config()),
        ))
    }
}
