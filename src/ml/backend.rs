//! 計算バックエンドの型とデバイス選択

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

use crate::error::Result;
use crate::model::config::DeviceType;

/// CPU (NdArray) バックエンド
pub type CpuBackend = NdArray<f32>;
/// 学習用 CPU バックエンド
pub type CpuTrainBackend = Autodiff<CpuBackend>;

/// WGPU バックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;
/// 学習用 WGPU バックエンド
#[cfg(feature = "wgpu")]
pub type GpuTrainBackend = Autodiff<GpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

#[cfg(feature = "wgpu")]
pub fn gpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::default()
}

/// 設定されたデバイスがこのビルドで使えるか確認する
pub fn ensure_available(device_type: DeviceType) -> Result<()> {
    match device_type {
        DeviceType::Cpu => Ok(()),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => Ok(()),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => Err(crate::error::ClassifierError::Config(
            "this build has no WGPU support; rebuild with the `wgpu` feature or use Cpu".to_string(),
        )),
    }
}
